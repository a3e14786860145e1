//! Typed configuration for cache sizes, pool sizes and selector thresholds.
//!
//! A serde-deserializable struct with a `Default` impl and a `load` constructor
//! that reads JSON from disk.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{TileError, TileResult};

pub const TILE_WIDTH: u32 = 256;
pub const TILE_PAGE_SIZE: usize = 128;
pub const MAX_TILE_PAGES: usize = 16;
pub const MAX_TILES: usize = 2048;
pub const CUBE_FACES: u8 = 6;
pub const MAX_ZOOM: u8 = 23;
pub const TILE_CPU_PAGE_SIZE: usize = 32;

/// Bytes occupied by one R32F elevation tile.
pub const fn tile_size_bytes() -> usize {
    (TILE_WIDTH as usize) * (TILE_WIDTH as usize) * std::mem::size_of::<f32>()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Requested CPU cache capacity in bytes; rounded up to a whole number of tiles.
    pub cpu_cache_bytes: usize,
    /// Requested GPU cache capacity in tiles.
    pub gpu_cache_tiles: usize,
    /// Entries per CPU page.
    pub cpu_page_size: usize,
    /// Slices per GPU texture-array page.
    pub gpu_page_size: usize,
    /// Screen-error threshold passed to the tile selector.
    pub selector_resolution: f64,
    /// Number of foreground (short-task) pool threads. `0` means "use all cores".
    pub foreground_threads: usize,
    /// Number of background (tile-production) pool threads. `0` means "use all cores".
    pub background_threads: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cpu_cache_bytes: 1 << 30,
            gpu_cache_tiles: MAX_TILE_PAGES * TILE_PAGE_SIZE,
            cpu_page_size: TILE_CPU_PAGE_SIZE,
            gpu_page_size: TILE_PAGE_SIZE,
            selector_resolution: 1e-5,
            foreground_threads: cores,
            background_threads: cores,
        }
    }
}

impl CacheConfig {
    pub fn load(path: &Path) -> TileResult<Self> {
        let text = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> TileResult<()> {
        if self.cpu_page_size == 0 {
            return Err(TileError::InvalidConfig("cpu_page_size must be > 0".into()));
        }
        if self.gpu_page_size == 0 {
            return Err(TileError::InvalidConfig("gpu_page_size must be > 0".into()));
        }
        if self.cpu_cache_bytes == 0 {
            return Err(TileError::InvalidConfig(
                "cpu_cache_bytes must be > 0".into(),
            ));
        }
        if self.gpu_cache_tiles == 0 {
            return Err(TileError::InvalidConfig(
                "gpu_cache_tiles must be > 0".into(),
            ));
        }
        if !self.selector_resolution.is_finite() || self.selector_resolution <= 0.0 {
            return Err(TileError::InvalidConfig(
                "selector_resolution must be a positive finite number".into(),
            ));
        }
        Ok(())
    }

    /// CPU cache capacity in whole tiles, ceiling-divided from the requested byte budget.
    pub fn cpu_capacity_tiles(&self) -> usize {
        let sz = tile_size_bytes();
        (self.cpu_cache_bytes.max(1) - 1) / sz + 1
    }
}

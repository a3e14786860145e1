//! Top-level orchestration: wires the CPU cache, GPU cache, tile selector and
//! loader pipeline into a single per-frame entry point for a renderer.

use std::sync::Arc;

use glam::DVec3;

use crate::config::CacheConfig;
use crate::cpu_cache::{CacheStats, CpuTileCache};
use crate::data_source::DataSource;
use crate::geometry::Frustum;
use crate::gpu_cache::{GpuIndex, GpuTileCache, GpuUploadSink, NullGpuSink};
use crate::loader::LoaderPipeline;
use crate::minmax_tree::{MinMax, MinMaxTree, MinMaxUpdateQueue};
use crate::selector::select_and_truncate;
use crate::tile_code::TileCode;

/// Combined CPU + GPU cache statistics for a frame.
#[derive(Debug, Clone, Default)]
pub struct CombinedCacheStats {
    pub cpu: CacheStats,
    pub cpu_resident_tiles: usize,
    pub gpu_resident_tiles: usize,
}

/// Per-draw handle: either a resident `(page, slot)` or the "not yet resident"
/// sentinel, in which case the renderer should fall back to whatever it drew
/// last frame for that tile (or skip the draw).
#[derive(Debug, Clone, Copy)]
pub struct TileDraw {
    pub code: TileCode,
    pub gpu_handle: Option<GpuIndex>,
}

/// Drives tile selection, CPU production and GPU residency for one planet
/// renderer. One instance per GPU context.
pub struct TileSystem<S: GpuUploadSink = NullGpuSink> {
    cpu_cache: Arc<CpuTileCache>,
    gpu_cache: Arc<GpuTileCache<S>>,
    source: Arc<dyn DataSource>,
    loader: LoaderPipeline,
    minmax_tree: Arc<MinMaxTree>,
    minmax_queue: Arc<MinMaxUpdateQueue>,
    resolution: f64,
}

impl TileSystem<NullGpuSink> {
    /// Convenience constructor for headless use (tests, benchmarks) where no
    /// real GPU context is available.
    pub fn new_headless(config: &CacheConfig, source: Arc<dyn DataSource>) -> Self {
        Self::new(config, source, Arc::new(NullGpuSink))
    }
}

impl<S: GpuUploadSink> TileSystem<S> {
    pub fn new(config: &CacheConfig, source: Arc<dyn DataSource>, sink: Arc<S>) -> Self {
        let cpu_cache = Arc::new(CpuTileCache::new(
            config.cpu_capacity_tiles(),
            config.cpu_page_size,
        ));
        let gpu_cache = Arc::new(GpuTileCache::new(
            config.gpu_cache_tiles,
            config.gpu_page_size,
            crate::config::tile_size_bytes(),
            sink,
        ));
        let minmax_queue = Arc::new(MinMaxUpdateQueue::new());
        let default_bounds = MinMax {
            min: source.min(),
            max: source.max(),
        };
        Self {
            cpu_cache,
            gpu_cache,
            source,
            loader: LoaderPipeline::new(config.background_threads, Arc::clone(&minmax_queue)),
            minmax_tree: Arc::new(MinMaxTree::new(default_bounds)),
            minmax_queue,
            resolution: config.selector_resolution,
        }
    }

    /// Run one frame: select visible tiles, drain the min/max queue, drive the
    /// CPU cache (queuing background loads for misses) and the GPU cache
    /// (queuing uploads for CPU-ready tiles), then submit the uploads.
    /// Returns one draw entry per selected tile, in screen-error order.
    pub fn update(&self, frustum: &mut Frustum, camera_pos: DVec3) -> Vec<TileDraw> {
        self.minmax_queue.drain_into(&self.minmax_tree);

        let selected = select_and_truncate(
            &*self.source,
            &self.minmax_tree,
            frustum,
            camera_pos,
            self.resolution,
        );

        let cache_for_cb = Arc::clone(&self.cpu_cache);
        let source_for_cb = Arc::clone(&self.source);
        let queue_for_cb = Arc::clone(&self.minmax_queue);
        let loader = &self.loader;

        let best_available = self.cpu_cache.update(&*self.source, &selected, |code, idx, in_flight| {
            loader.submit(
                Arc::clone(&cache_for_cb),
                Arc::clone(&source_for_cb),
                code,
                idx,
                in_flight,
                Arc::clone(&queue_for_cb),
            );
        });

        let resident: Vec<TileCode> = best_available
            .iter()
            .copied()
            .filter(|c| !c.is_none())
            .collect();
        let _gpu_ready = self.gpu_cache.update(&self.cpu_cache, &resident);
        self.gpu_cache.upload_queued(&self.cpu_cache);

        best_available
            .into_iter()
            .map(|code| TileDraw {
                code,
                gpu_handle: if code.is_none() {
                    None
                } else {
                    self.gpu_cache.handle(code)
                },
            })
            .collect()
    }

    pub fn bind_textures(&self, base_unit: u32) {
        self.gpu_cache.bind_textures(base_unit);
    }

    pub fn cache_stats(&self) -> CombinedCacheStats {
        CombinedCacheStats {
            cpu: self.cpu_cache.stats(),
            cpu_resident_tiles: self.cpu_cache.len(),
            gpu_resident_tiles: self.gpu_cache.len(),
        }
    }

    pub fn cpu_cache(&self) -> &Arc<CpuTileCache> {
        &self.cpu_cache
    }

    pub fn gpu_cache(&self) -> &Arc<GpuTileCache<S>> {
        &self.gpu_cache
    }

    pub fn minmax_tree(&self) -> &Arc<MinMaxTree> {
        &self.minmax_tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::SyntheticDataSource;
    use crate::geometry::camera_frustum;
    use glam::DMat4;

    fn looking_at_origin(distance: f64) -> (DVec3, Frustum) {
        let eye = DVec3::new(0.0, 0.0, distance);
        let view = DMat4::look_at_rh(eye, DVec3::ZERO, DVec3::Y);
        let proj = DMat4::perspective_rh(1.0, 1.0, 0.01, distance * 4.0);
        (eye, camera_frustum(proj * view))
    }

    #[test]
    fn update_returns_a_draw_entry_per_selected_tile() {
        let mut config = CacheConfig::default();
        config.selector_resolution = 1e-4;
        let source: Arc<dyn DataSource> = Arc::new(SyntheticDataSource::new(1));
        let system = TileSystem::new_headless(&config, source);

        let (eye, mut frustum) = looking_at_origin(5.0);
        let draws = system.update(&mut frustum, eye);
        assert!(!draws.is_empty(), "camera facing the planet should select tiles");
    }

    #[test]
    fn repeated_updates_eventually_make_tiles_gpu_resident() {
        let mut config = CacheConfig::default();
        config.selector_resolution = 1e-2;
        let source: Arc<dyn DataSource> = Arc::new(SyntheticDataSource::new(1));
        let system = TileSystem::new_headless(&config, source);
        let (eye, mut frustum) = looking_at_origin(5.0);

        let mut became_resident = false;
        for _ in 0..50 {
            let draws = system.update(&mut frustum, eye);
            if draws.iter().any(|d| d.gpu_handle.is_some()) {
                became_resident = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(became_resident, "tiles never became GPU-resident after repeated updates");
    }

    #[test]
    fn cache_stats_report_resident_counts() {
        let config = CacheConfig::default();
        let source: Arc<dyn DataSource> = Arc::new(SyntheticDataSource::new(1));
        let system = TileSystem::new_headless(&config, source);
        let stats = system.cache_stats();
        assert_eq!(stats.cpu_resident_tiles, 0);
        assert_eq!(stats.gpu_resident_tiles, 0);
    }
}

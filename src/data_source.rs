//! Pluggable tile data source. The loader pipeline drives implementors of
//! [`DataSource`] to fill tile byte buffers; the built-in
//! [`SyntheticDataSource`] generates band-limited fractal-noise elevation
//! tiles for tests and for running the cache without a real terrain dataset.

use std::f64::consts::{PI, TAU};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::TILE_WIDTH;
use crate::morton::morton_u64_to_rect_f64;
use crate::tile_code::TileCode;

/// Polled by the worker between scanlines; the source is expected to check
/// it at natural boundaries but tolerates not checking (wasted, not incorrect).
pub trait CancellationToken: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

pub struct NeverCancelled;
impl CancellationToken for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

pub trait DataSource: Send + Sync {
    /// Returns the best code the source actually has data for; may coarsen.
    fn find(&self, code: TileCode) -> TileCode;

    /// Fills `dst` (exactly `TILE_WIDTH*TILE_WIDTH` `f32` elevation samples,
    /// row-major) for `code`, polling `token` between rows.
    fn load(&self, code: TileCode, dst: &mut [f32], token: &dyn CancellationToken);

    /// Pointwise elevation sample in `[-1,1]`-ish units, used by the selector
    /// to build per-tile AABBs.
    fn sample(&self, uv: glam::DVec2, face: u8) -> f32;

    fn min(&self) -> f32;
    fn max(&self) -> f32;
}

const COEFF_COUNT: usize = 100;
const TEST_FREQ: f64 = 160.0;

/// A band-limited sum of cosines across `bands x orders` frequency pairs with
/// randomized phases, smoothly windowed to taper to zero at tile edges.
struct NoiseBands {
    phi: Vec<Vec<f64>>,
    cos_phi: Vec<Vec<f64>>,
    gamma_d3n: Vec<f64>,
    gamma_n: Vec<f64>,
}

const BAND_M: usize = 12;
const BAND_N: usize = 8;
const NOISE_L: f64 = 0.5;
const NOISE_D: f64 = 2.2;
const NOISE_G: f64 = 1.1;
const NOISE_GAMMA: f64 = 2.5;
const NOISE_AMP: f64 = 0.1;

impl NoiseBands {
    fn new(rng: &mut ChaCha8Rng) -> Self {
        let mut phi = vec![vec![0.0; BAND_N]; BAND_M];
        let mut cos_phi = vec![vec![0.0; BAND_N]; BAND_M];
        for m in 0..BAND_M {
            for n in 0..BAND_N {
                let p = rng.gen::<f64>() * TAU;
                phi[m][n] = p;
                cos_phi[m][n] = p.cos();
            }
        }
        let mut gamma_d3n = vec![0.0; BAND_N];
        let mut gamma_n = vec![0.0; BAND_N];
        for n in 0..BAND_N {
            gamma_d3n[n] = NOISE_GAMMA.powf((NOISE_D - 3.0) * n as f64);
            gamma_n[n] = NOISE_GAMMA.powf(n as f64);
        }
        Self {
            phi,
            cos_phi,
            gamma_d3n,
            gamma_n,
        }
    }

    /// Smooth function zero (to first derivative) at the tile edges `x=-1,1`.
    fn filter_band(x: f64) -> f64 {
        let a = 1.0 - x * x * x * x;
        2.0 * a * a / (1.0 + a * a)
    }

    fn warp(x: f64) -> f64 {
        const B: f64 = 6.0;
        -(1.0 / (B * B)) * (1.0 / (1.0 + (B * B * x).exp())).ln()
    }

    fn elevation(&self, uv: glam::DVec2, face: u8) -> f64 {
        let a = NOISE_L
            * (NOISE_G / NOISE_D).powf(NOISE_D - 2.0)
            * (NOISE_GAMMA.ln() / BAND_M as f64).sqrt();

        let x = 1.0 - 2.0 * uv.x;
        let y = 1.0 - 2.0 * uv.y;
        let r = x.hypot(y);
        let tht = y.atan2(x);

        let mut g = 0.0;
        for m in 0..BAND_M {
            for n in 0..BAND_N {
                let phi_mn = face as f64 + self.phi[m][n];
                g += self.gamma_d3n[n]
                    * (self.cos_phi[m][n]
                        - (TAU * self.gamma_n[n] * r * (tht - PI * m as f64 / BAND_M as f64).cos()
                            / NOISE_L
                            + phi_mn)
                            .cos());
            }
        }
        g *= a * NOISE_AMP;
        Self::warp(g * Self::filter_band(x) * Self::filter_band(y))
    }
}

/// Built-in synthetic elevation generator: deterministic (seeded), band-limited
/// fractal noise. Conforms to the same [`DataSource`] interface a file-backed
/// source would.
pub struct SyntheticDataSource {
    bands: NoiseBands,
    /// Caps the zoom level the source claims to actually have data for,
    /// mirroring a debug/availability knob so tests can simulate a source
    /// that only covers coarse levels.
    pub max_available_zoom: u8,
}

impl SyntheticDataSource {
    pub fn new(seed: u64) -> Self {
        Self::with_max_zoom(seed, 10)
    }

    pub fn with_max_zoom(seed: u64, max_available_zoom: u8) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Self {
            bands: NoiseBands::new(&mut rng),
            max_available_zoom,
        }
    }
}

impl DataSource for SyntheticDataSource {
    fn find(&self, mut code: TileCode) -> TileCode {
        while code.zoom > self.max_available_zoom {
            code = code.coarsen();
        }
        code
    }

    fn load(&self, code: TileCode, dst: &mut [f32], token: &dyn CancellationToken) {
        debug_assert_eq!(dst.len(), (TILE_WIDTH * TILE_WIDTH) as usize);
        let rect = morton_u64_to_rect_f64(code.idx, code.zoom);
        let d = 1.0 / (TILE_WIDTH as f64 - 1.0);

        let mut idx = 0usize;
        for i in 0..TILE_WIDTH {
            if token.is_cancelled() {
                return;
            }
            let v = i as f64 * d;
            let lo = rect.ll();
            let hi = rect.ur();
            for j in 0..TILE_WIDTH {
                let u = j as f64 * d;
                let uv = lo + (hi - lo) * glam::dvec2(u, v);
                dst[idx] = self.bands.elevation(uv, code.face) as f32;
                idx += 1;
            }
        }
    }

    fn sample(&self, uv: glam::DVec2, face: u8) -> f32 {
        self.bands.elevation(uv, face) as f32
    }

    fn min(&self) -> f32 {
        -NOISE_AMP as f32
    }

    fn max(&self) -> f32 {
        NOISE_AMP as f32
    }
}

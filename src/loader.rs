//! Background load pipeline: drives a pluggable [`DataSource`] to fill CPU
//! cache pages, choreographing the `EMPTY -> QUEUED -> LOADING ->
//! {READY, EMPTY}` transitions for cache entries.
//!
//! Two pools: a dedicated, named background `rayon::ThreadPool` for tile
//! production (blocking calls into the data source), and the process-wide
//! default rayon pool for short foreground tasks (GPU staging copies, in
//! `gpu_cache`). A dedicated pool sized off hardware concurrency with
//! per-tile cancellation via the state word itself, rather than a separate
//! cancellation flag.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cpu_cache::CpuTileCache;
use crate::data_source::{CancellationToken, DataSource};
use crate::minmax_tree::{MinMax, MinMaxUpdateQueue};
use crate::pct::{PctIndex, Status};
use crate::tile_code::TileCode;

/// Observational cancellation token backed by an entry's state word. Missing
/// a check wastes work rather than corrupting it, so the source is free to
/// poll it only at natural boundaries (per scanline).
struct EntryCancellationToken {
    cache: Arc<CpuTileCache>,
    idx: PctIndex,
}

impl CancellationToken for EntryCancellationToken {
    fn is_cancelled(&self) -> bool {
        self.cache.entry_state(self.idx).status == Status::Cancelled
    }
}

/// Background tile-production pipeline. Holds the dedicated worker pool and
/// the min/max update queue that loaded tiles report their bounds into.
pub struct LoaderPipeline {
    background: rayon::ThreadPool,
    minmax_queue: Arc<MinMaxUpdateQueue>,
}

impl LoaderPipeline {
    pub fn new(background_threads: usize, minmax_queue: Arc<MinMaxUpdateQueue>) -> Self {
        let threads = background_threads.max(1);
        let background = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("tile-loader-{idx}"))
            .build()
            .expect("failed to create background tile-loader pool");
        Self {
            background,
            minmax_queue,
        }
    }

    /// Submit a tile for background production. `cache` must already have
    /// reserved `idx` for `code` via `PagedTable::load` with `needs_load`.
    /// Increments `in_flight` immediately and decrements it when the worker
    /// finishes, regardless of outcome.
    pub fn submit(
        &self,
        cache: Arc<CpuTileCache>,
        source: Arc<dyn DataSource>,
        code: TileCode,
        idx: PctIndex,
        in_flight: Arc<AtomicUsize>,
        minmax_queue: Arc<MinMaxUpdateQueue>,
    ) {
        in_flight.fetch_add(1, Ordering::AcqRel);

        // Step 1 of the load protocol: submitter CAS EMPTY -> QUEUED.
        if cache
            .try_transition(idx, Status::Empty, Status::Queued)
            .is_err()
        {
            // Slot state changed underneath us before we could queue it
            // (e.g. a racing cancel); nothing to submit.
            in_flight.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        self.background.spawn(move || {
            Self::run_load(&cache, &source, code, idx, &minmax_queue);
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn run_load(
        cache: &Arc<CpuTileCache>,
        source: &Arc<dyn DataSource>,
        code: TileCode,
        idx: PctIndex,
        minmax_queue: &MinMaxUpdateQueue,
    ) {
        // Step 2: worker CAS QUEUED -> LOADING. If that fails, the only
        // other reachable state is CANCELLED (only the owning render thread
        // ever sets status, and eviction is the only other writer to this
        // entry while QUEUED).
        if cache
            .try_transition(idx, Status::Queued, Status::Loading)
            .is_err()
        {
            log::debug!(target: "loader", "tile {code:?} cancelled before load started");
            let _ = cache.try_transition(idx, Status::Cancelled, Status::Empty);
            return;
        }

        let tile_size = crate::config::TILE_WIDTH as usize * crate::config::TILE_WIDTH as usize;
        let mut samples = vec![0.0f32; tile_size];
        let token = EntryCancellationToken {
            cache: Arc::clone(cache),
            idx,
        };
        source.load(code, &mut samples, &token);

        if token.is_cancelled() {
            log::debug!(target: "loader", "tile {code:?} cancelled during load");
            let _ = cache.try_transition(idx, Status::Cancelled, Status::Empty);
            return;
        }

        let bytes = f32_samples_to_le_bytes(&samples);
        cache.write_bytes(idx, &bytes);

        let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
        for &v in &samples {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        minmax_queue.push(code, MinMax { min: lo, max: hi });

        // Step 3: worker CAS LOADING -> READY, unless the slot was
        // cancelled while we were producing it.
        if cache
            .try_transition(idx, Status::Loading, Status::Ready)
            .is_err()
        {
            log::debug!(target: "loader", "tile {code:?} cancelled after load completed");
            let _ = cache.try_transition(idx, Status::Cancelled, Status::Empty);
        }
    }

    pub fn minmax_queue(&self) -> &Arc<MinMaxUpdateQueue> {
        &self.minmax_queue
    }
}

/// Encode an `f32` elevation buffer as little-endian bytes, matching the byte
/// layout `CpuTileCache` stores tiles in.
fn f32_samples_to_le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * std::mem::size_of::<f32>());
    for &v in samples {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::SyntheticDataSource;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until<F: Fn() -> bool>(f: F, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    #[test]
    fn miss_queue_load_ready_end_to_end() {
        let cache = Arc::new(CpuTileCache::new(8, 4));
        let source: Arc<dyn DataSource> = Arc::new(SyntheticDataSource::new(1));
        let minmax_queue = Arc::new(MinMaxUpdateQueue::new());
        let pipeline = LoaderPipeline::new(2, Arc::clone(&minmax_queue));
        let code = TileCode::new(0, 0, 0);

        let cache_for_cb = Arc::clone(&cache);
        let source_for_cb = Arc::clone(&source);
        let pipeline_ref = &pipeline;
        let queue_for_cb = Arc::clone(&minmax_queue);

        let out = cache.update(&*source, &[code], |c, idx, in_flight_cb| {
            pipeline_ref.submit(
                Arc::clone(&cache_for_cb),
                Arc::clone(&source_for_cb),
                c,
                idx,
                in_flight_cb,
                Arc::clone(&queue_for_cb),
            );
        });
        assert!(out[0].is_none() || out[0] == code);

        let ready = wait_until(
            || cache.acquire(code).map(|r| { cache.release(r); true }).unwrap_or(false),
            Duration::from_secs(2),
        );
        assert!(ready, "tile never became ready");
        assert_eq!(cache.in_flight(), 0);

        let drained = minmax_queue.drain_into(&crate::minmax_tree::MinMaxTree::new(
            MinMax { min: 0.0, max: 0.0 },
        ));
        assert_eq!(drained, 1);
    }

    #[test]
    fn cancelled_slot_is_reset_to_empty_not_left_ready() {
        let cache = Arc::new(CpuTileCache::new(1, 1));
        let source: Arc<dyn DataSource> = Arc::new(SyntheticDataSource::new(1));
        let code = TileCode::new(0, 0, 0);

        let mut reserved = None;
        let _ = cache.update(&*source, &[code], |c, idx, _in_flight| {
            reserved = Some((c, idx));
        });
        let (_, idx) = reserved.expect("a slot must have been reserved for the miss");
        assert_eq!(cache.entry_state(idx).status, Status::Empty);
        cache
            .try_transition(idx, Status::Empty, Status::Queued)
            .expect("submitter CAS EMPTY -> QUEUED");

        // Simulate eviction racing with production: force CANCELLED from the
        // QUEUED state exactly as `PagedTable::evict_one` would under pressure.
        assert!(cache
            .try_transition(idx, Status::Queued, Status::Cancelled)
            .is_ok());
        assert!(cache.acquire(code).is_none());

        // Worker arrives late and finds CANCELLED instead of QUEUED.
        assert!(cache
            .try_transition(idx, Status::Queued, Status::Loading)
            .is_err());
        assert!(cache
            .try_transition(idx, Status::Cancelled, Status::Empty)
            .is_ok());
        assert_eq!(cache.entry_state(idx).status, Status::Empty);
    }
}

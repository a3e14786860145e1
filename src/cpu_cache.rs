//! CPU-side tile cache: a `PagedTable` specialized for fixed-size byte pages,
//! plus the per-frame `update`/`find_best` traversal and the global
//! in-flight-tiles backpressure counter.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::tile_size_bytes;
use crate::data_source::DataSource;
use crate::pct::{PagedTable, PctIndex, Status};
use crate::tile_code::TileCode;

/// Process-wide cap on tiles currently being produced, set to roughly half of
/// available hardware concurrency so background production never starves the
/// render thread's own foreground work.
pub fn default_max_tiles_in_flight() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / 2).max(1)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub queued: u64,
}

/// A page's backing store: one contiguous byte buffer sized `page_size * tile_size`.
pub struct CpuPageBacking {
    pub bytes: Mutex<Vec<u8>>,
}

pub struct CpuTileCache {
    table: Mutex<PagedTable<CpuPageBacking>>,
    tile_size: usize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
    stats: Mutex<CacheStats>,
}

impl CpuTileCache {
    pub fn new(capacity_tiles: usize, page_size: usize) -> Self {
        let tile_size = tile_size_bytes();
        let table = PagedTable::new(
            capacity_tiles,
            page_size,
            Box::new(move || CpuPageBacking {
                bytes: Mutex::new(vec![0u8; page_size * tile_size]),
            }),
        );
        Self {
            table: Mutex::new(table),
            tile_size,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: default_max_tiles_in_flight(),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Walk up the ancestry chain until a READY entry is found, splicing it
    /// to the LRU head. Returns the sentinel "none" code on exhaustion.
    pub fn find_best(&self, mut code: TileCode) -> TileCode {
        let mut table = self.table.lock();
        loop {
            if let Some(idx) = table.get(code.pack()) {
                let state = table.entry(idx).state.load(Ordering::Acquire);
                if state.status == Status::Ready {
                    table.touch(idx);
                    return code;
                }
            }
            if code.zoom == 0 {
                return crate::tile_code::TILE_CODE_NONE;
            }
            code = code.coarsen();
        }
    }

    /// For each requested tile: resolve the source's available code, reserve
    /// a slot, enqueue background production if needed (deduplicated per
    /// call), and report back the available code if its slot is ready, or
    /// the best ready ancestor of the available code otherwise. The
    /// available code (not the originally requested one) is what the table
    /// keys are reserved under, and is therefore the only code guaranteed to
    /// ever become resident.
    pub fn update<F>(&self, source: &dyn DataSource, tiles: &[TileCode], mut enqueue_load: F) -> Vec<TileCode>
    where
        F: FnMut(TileCode, PctIndex, Arc<AtomicUsize>),
    {
        let mut submitted = HashSet::new();
        let mut out = Vec::with_capacity(tiles.len());
        let mut stats = CacheStats::default();

        {
            let mut table = self.table.lock();
            for &ideal in tiles {
                let available = source.find(ideal);
                let res = table.load(available.pack());

                if res.idx.is_valid() {
                    if res.needs_load && submitted.insert(available.pack()) {
                        if self.in_flight.load(Ordering::Relaxed) < self.max_in_flight {
                            stats.queued += 1;
                            enqueue_load(available, res.idx, Arc::clone(&self.in_flight));
                        }
                        // else: excess submissions are silently skipped and
                        // retried next frame, per the backpressure contract.
                    }
                    if res.is_ready {
                        stats.hits += 1;
                        out.push(available);
                        continue;
                    }
                }

                stats.misses += 1;
                out.push(self.find_best_locked(&mut table, available));
            }
        }

        *self.stats.lock() = stats;
        out
    }

    fn find_best_locked(&self, table: &mut PagedTable<CpuPageBacking>, mut code: TileCode) -> TileCode {
        loop {
            if let Some(idx) = table.get(code.pack()) {
                let state = table.entry(idx).state.load(Ordering::Acquire);
                if state.status == Status::Ready {
                    table.touch(idx);
                    return code;
                }
            }
            if code.zoom == 0 {
                return crate::tile_code::TILE_CODE_NONE;
            }
            code = code.coarsen();
        }
    }

    pub fn acquire(&self, code: TileCode) -> Option<PctIndex> {
        self.table.lock().acquire(code.pack())
    }

    pub fn release(&self, idx: PctIndex) {
        self.table.lock().release(idx);
    }

    /// Read a ready tile's bytes out, given an acquired index. Returns a
    /// cheaply-cloneable [`bytes::Bytes`] so the GPU upload path can hand the
    /// same buffer across the staging task without a second copy.
    pub fn read_bytes(&self, idx: PctIndex) -> bytes::Bytes {
        let table = self.table.lock();
        let page = table.page(idx.page);
        let start = idx.ent as usize * self.tile_size;
        let guard = page.backing.bytes.lock();
        bytes::Bytes::copy_from_slice(&guard[start..start + self.tile_size])
    }

    /// Write produced bytes into a reserved slot (called from a worker).
    pub fn write_bytes(&self, idx: PctIndex, data: &[u8]) {
        let table = self.table.lock();
        let page = table.page(idx.page);
        let start = idx.ent as usize * self.tile_size;
        let mut guard = page.backing.bytes.lock();
        guard[start..start + data.len()].copy_from_slice(data);
    }

    pub fn entry_state(&self, idx: PctIndex) -> crate::pct::State {
        self.table.lock().entry(idx).state.load(Ordering::Acquire)
    }

    pub fn with_entry<R>(&self, idx: PctIndex, f: impl FnOnce(&crate::pct::Entry) -> R) -> R {
        let table = self.table.lock();
        f(table.entry(idx))
    }

    /// Single-attempt CAS from `from` to `to`, preserving `gen`/`refs`. On
    /// failure returns the status actually observed (the load protocol uses
    /// this to detect a concurrent CANCELLED transition, not to retry).
    pub fn try_transition(
        &self,
        idx: PctIndex,
        from: Status,
        to: Status,
    ) -> Result<(), Status> {
        self.with_entry(idx, |entry| {
            let current = entry.state.load(Ordering::Acquire);
            if current.status != from {
                return Err(current.status);
            }
            let desired = crate::pct::State::new(to, current.gen, current.refs);
            entry
                .state
                .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire)
                .map(|_| ())
                .map_err(|s| s.status)
        })
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

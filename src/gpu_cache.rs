//! GPU-side tile cache: a bounded paged table of resident textures, filled
//! from the CPU cache via a two-stage async upload pipeline (parallel
//! staging-buffer memcpy, then serialized GPU subimage copies on the render
//! thread).
//!
//! Deliberately not a reuse of `pct::PagedTable`: the GPU side's status set
//! differs (`UPLOADING` instead of `LOADING`, no ref count — nothing holds a
//! "read reference" into a bound texture the way CPU readers do), so it gets
//! its own, simpler state word.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cpu_cache::CpuTileCache;
use crate::pct::PctIndex;
use crate::tile_code::TileCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GpuStatus {
    Empty = 0,
    Queued = 1,
    Uploading = 2,
    Ready = 3,
    Cancelled = 4,
}

impl GpuStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GpuStatus::Empty,
            1 => GpuStatus::Queued,
            2 => GpuStatus::Uploading,
            3 => GpuStatus::Ready,
            4 => GpuStatus::Cancelled,
            _ => panic!("invalid gpu status byte: {v}"),
        }
    }
}

/// Unpacked view of the GPU entry's 64-bit state word: `status(8) | gen(32)`.
/// No `flags` or `refs` field — the GPU side has no analogue of a CPU read
/// reference, so nothing needs to be kept pinned against eviction beyond
/// "don't evict while it's mid-upload".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuState {
    pub status: GpuStatus,
    pub gen: u32,
}

const STATUS_SHIFT: u32 = 0;
const GEN_SHIFT: u32 = 16;

impl GpuState {
    pub const fn new(status: GpuStatus, gen: u32) -> Self {
        Self { status, gen }
    }

    pub const fn pack(self) -> u64 {
        ((self.status as u64) << STATUS_SHIFT) | ((self.gen as u64) << GEN_SHIFT)
    }

    pub fn unpack(bits: u64) -> Self {
        Self {
            status: GpuStatus::from_u8(((bits >> STATUS_SHIFT) & 0xFF) as u8),
            gen: ((bits >> GEN_SHIFT) & 0xFFFF_FFFF) as u32,
        }
    }
}

struct AtomicGpuState(AtomicU64);

impl AtomicGpuState {
    fn new(state: GpuState) -> Self {
        Self(AtomicU64::new(state.pack()))
    }

    fn load(&self, order: Ordering) -> GpuState {
        GpuState::unpack(self.0.load(order))
    }

    fn store(&self, bits: u64, order: Ordering) {
        self.0.store(bits, order);
    }

    fn compare_exchange(
        &self,
        current: GpuState,
        new: GpuState,
        success: Ordering,
        failure: Ordering,
    ) -> Result<GpuState, GpuState> {
        self.0
            .compare_exchange(current.pack(), new.pack(), success, failure)
            .map(GpuState::unpack)
            .map_err(GpuState::unpack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuIndex {
    pub page: u32,
    pub slot: u32,
}

impl GpuIndex {
    pub const NONE: GpuIndex = GpuIndex {
        page: u32::MAX,
        slot: u32::MAX,
    };

    pub fn is_valid(self) -> bool {
        self != Self::NONE
    }
}

struct GpuEntry {
    key: u64,
    state: AtomicGpuState,
}

struct GpuPage {
    entries: Vec<GpuEntry>,
    free_list: Vec<u32>,
}

impl GpuPage {
    fn new(page_size: usize) -> Self {
        let mut entries = Vec::with_capacity(page_size);
        for _ in 0..page_size {
            entries.push(GpuEntry {
                key: 0,
                state: AtomicGpuState::new(GpuState::new(GpuStatus::Empty, 0)),
            });
        }
        Self {
            entries,
            free_list: (0..page_size as u32).rev().collect(),
        }
    }
}

/// The render-thread-facing surface for an actual GPU texture-array backend.
/// Kept as a trait since this crate has no literal GL/Vulkan context of its
/// own (the GPU context is an external collaborator); implementors own the
/// texture-array handles keyed by `(page, slot)`.
pub trait GpuUploadSink: Send + Sync {
    /// Copy `bytes` (one tile's raw elevation raster) into texture-array
    /// `page`'s slice `slot`.
    fn upload_subimage(&self, page: u32, slot: u32, bytes: &[u8]);

    /// Bind texture-array `page` to texture unit `unit`.
    fn bind_texture_array(&self, page: u32, unit: u32);
}

/// Discards uploads; useful when running the cache headless (tests, or a
/// dry run with no GPU context attached).
pub struct NullGpuSink;
impl GpuUploadSink for NullGpuSink {
    fn upload_subimage(&self, _page: u32, _slot: u32, _bytes: &[u8]) {}
    fn bind_texture_array(&self, _page: u32, _unit: u32) {}
}

/// Records every call for assertions in tests.
#[derive(Default)]
pub struct RecordingGpuSink {
    pub uploads: Mutex<Vec<(u32, u32, usize)>>,
    pub binds: Mutex<Vec<(u32, u32)>>,
}

impl GpuUploadSink for RecordingGpuSink {
    fn upload_subimage(&self, page: u32, slot: u32, bytes: &[u8]) {
        self.uploads.lock().push((page, slot, bytes.len()));
    }
    fn bind_texture_array(&self, page: u32, unit: u32) {
        self.binds.lock().push((page, unit));
    }
}

struct GpuTable {
    pages: Vec<GpuPage>,
    lru: VecDeque<GpuIndex>,
    map: HashMap<u64, GpuIndex>,
    open_pages: BinaryHeap<Reverse<u32>>,
    page_size: usize,
    capacity: usize,
}

impl GpuTable {
    fn new(capacity: usize, page_size: usize) -> Self {
        assert!(page_size > 0 && capacity > 0);
        Self {
            pages: Vec::new(),
            lru: VecDeque::new(),
            map: HashMap::new(),
            open_pages: BinaryHeap::new(),
            page_size,
            capacity,
        }
    }

    fn entry(&self, idx: GpuIndex) -> &GpuEntry {
        &self.pages[idx.page as usize].entries[idx.slot as usize]
    }

    fn touch_front(&mut self, idx: GpuIndex) {
        if let Some(pos) = self.lru.iter().position(|&i| i == idx) {
            self.lru.remove(pos);
        }
        self.lru.push_front(idx);
    }

    fn allocate(&mut self) -> Option<GpuIndex> {
        if self.open_pages.is_empty() {
            let max_pages = (self.capacity - 1) / self.page_size + 1;
            if self.pages.len() >= max_pages {
                return None;
            }
            let page_index = self.pages.len() as u32;
            self.pages.push(GpuPage::new(self.page_size));
            self.open_pages.push(Reverse(page_index));
        }
        let Reverse(page_index) = *self.open_pages.peek().unwrap();
        let page = &mut self.pages[page_index as usize];
        let slot = page.free_list.pop().expect("open page must have a free slot");
        if page.free_list.is_empty() {
            self.open_pages.pop();
        }
        Some(GpuIndex {
            page: page_index,
            slot,
        })
    }

    fn free_slot(&mut self, idx: GpuIndex) {
        let page = &mut self.pages[idx.page as usize];
        if page.free_list.is_empty() {
            self.open_pages.push(Reverse(idx.page));
        }
        page.free_list.push(idx.slot);
    }

    /// Single-attempt eviction: unlike the CPU table's retry-until-settled
    /// loop, a CAS race here just aborts this round's eviction rather than
    /// retrying — the caller tries again next frame.
    fn evict_one(&mut self) -> Option<GpuIndex> {
        let &tail = self.lru.back()?;
        let entry = self.entry(tail);
        let current = entry.state.load(Ordering::Acquire);
        match current.status {
            GpuStatus::Cancelled | GpuStatus::Queued | GpuStatus::Uploading => None,
            GpuStatus::Empty | GpuStatus::Ready => {
                let desired = GpuState::new(GpuStatus::Empty, current.gen.wrapping_add(1));
                match entry
                    .state
                    .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        let key = self.entry(tail).key;
                        self.lru.pop_back();
                        self.map.remove(&key);
                        self.free_slot(tail);
                        Some(tail)
                    }
                    Err(_) => None,
                }
            }
        }
    }

    fn reserve(&mut self, key: u64) -> Option<GpuIndex> {
        if let Some(&idx) = self.map.get(&key) {
            self.touch_front(idx);
            return Some(idx);
        }
        let idx = if self.map.len() >= self.capacity {
            self.evict_one()?
        } else {
            self.allocate()?
        };
        let prev_gen = self.entry(idx).state.load(Ordering::Acquire).gen;
        {
            let page = &mut self.pages[idx.page as usize];
            let entry = &mut page.entries[idx.slot as usize];
            entry.key = key;
            entry.state.store(
                GpuState::new(GpuStatus::Empty, prev_gen.wrapping_add(1)).pack(),
                Ordering::Release,
            );
        }
        self.lru.push_front(idx);
        self.map.insert(key, idx);
        Some(idx)
    }

    fn get(&self, key: u64) -> Option<GpuIndex> {
        self.map.get(&key).copied()
    }
}

/// One queued-for-upload tile: its GPU slot and the CPU cache index holding
/// the source bytes, kept acquired (ref-counted) until the upload completes.
struct PendingUpload {
    code: TileCode,
    gpu_idx: GpuIndex,
    cpu_idx: PctIndex,
}

pub struct GpuTileCache<S: GpuUploadSink> {
    table: Mutex<GpuTable>,
    tile_size: usize,
    sink: Arc<S>,
    pending: Mutex<Vec<PendingUpload>>,
}

impl<S: GpuUploadSink> GpuTileCache<S> {
    pub fn new(capacity_tiles: usize, page_size: usize, tile_size: usize, sink: Arc<S>) -> Self {
        Self {
            table: Mutex::new(GpuTable::new(capacity_tiles, page_size)),
            tile_size,
            sink,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn contains(&self, code: TileCode) -> bool {
        let idx = self.table.lock().get(code.pack());
        idx.is_some_and(|idx| self.entry_state(idx).status == GpuStatus::Ready)
    }

    /// `(page, slot)` draw-time handle for a resident, ready tile.
    pub fn handle(&self, code: TileCode) -> Option<GpuIndex> {
        let idx = self.table.lock().get(code.pack())?;
        (self.entry_state(idx).status == GpuStatus::Ready).then_some(idx)
    }

    fn entry_state(&self, idx: GpuIndex) -> GpuState {
        self.table.lock().entry(idx).state.load(Ordering::Acquire)
    }

    /// Single-attempt CAS from `from` to `to`, preserving `gen`.
    fn try_transition(&self, idx: GpuIndex, from: GpuStatus, to: GpuStatus) -> Result<(), GpuStatus> {
        let table = self.table.lock();
        let entry = table.entry(idx);
        let current = entry.state.load(Ordering::Acquire);
        if current.status != from {
            return Err(current.status);
        }
        let desired = GpuState::new(to, current.gen);
        entry
            .state
            .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|s| s.status)
    }

    /// For each CPU-ready tile the selector wants resident on the GPU:
    /// reserve a slot (evicting the GPU LRU tail if needed) and, if it is
    /// not already resident, acquire a CPU read reference and queue it for
    /// upload. Returns the codes that are already GPU-ready this call.
    pub fn update(&self, cpu_cache: &CpuTileCache, tiles: &[TileCode]) -> Vec<TileCode> {
        let mut ready = Vec::new();
        let mut pending = self.pending.lock();
        for &code in tiles {
            let key = code.pack();
            let already_resident = {
                let table = self.table.lock();
                table.get(key).is_some()
            };

            let Some(cpu_idx) = cpu_cache.acquire(code) else {
                continue;
            };

            let gpu_idx = {
                let mut table = self.table.lock();
                table.reserve(key)
            };
            let Some(gpu_idx) = gpu_idx else {
                cpu_cache.release(cpu_idx);
                continue;
            };

            let status = self.entry_state(gpu_idx).status;
            if status == GpuStatus::Ready {
                ready.push(code);
                cpu_cache.release(cpu_idx);
                continue;
            }

            if already_resident && status != GpuStatus::Empty {
                // Already queued/uploading from an earlier frame.
                cpu_cache.release(cpu_idx);
                continue;
            }

            if self.try_transition(gpu_idx, GpuStatus::Empty, GpuStatus::Queued).is_ok() {
                pending.push(PendingUpload {
                    code,
                    gpu_idx,
                    cpu_idx,
                });
            } else {
                cpu_cache.release(cpu_idx);
            }
        }
        ready
    }

    /// Two-stage upload: stage queued tiles' bytes into per-tile buffers in
    /// parallel (the process default pool), CAS each to UPLOADING as its
    /// copy is handed off, spin-wait for the batch to finish copying, then
    /// serialize the actual GPU subimage copies on the calling (render)
    /// thread — a GPU context may only be driven from one thread.
    pub fn upload_queued(&self, cpu_cache: &Arc<CpuTileCache>) {
        let batch: Vec<PendingUpload> = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }

        let staging: Vec<Arc<Mutex<bytes::Bytes>>> = (0..batch.len())
            .map(|_| Arc::new(Mutex::new(bytes::Bytes::new())))
            .collect();
        let remaining = Arc::new(AtomicUsize::new(0));

        for (i, item) in batch.iter().enumerate() {
            if self
                .try_transition(item.gpu_idx, GpuStatus::Queued, GpuStatus::Uploading)
                .is_err()
            {
                continue;
            }
            remaining.fetch_add(1, Ordering::AcqRel);
            let cpu_cache = Arc::clone(cpu_cache);
            let cpu_idx = item.cpu_idx;
            let dst = Arc::clone(&staging[i]);
            let remaining = Arc::clone(&remaining);
            rayon::spawn(move || {
                *dst.lock() = cpu_cache.read_bytes(cpu_idx);
                remaining.fetch_sub(1, Ordering::AcqRel);
            });
        }

        while remaining.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }

        for (i, item) in batch.into_iter().enumerate() {
            let bytes = staging[i].lock();
            if !bytes.is_empty() {
                self.sink
                    .upload_subimage(item.gpu_idx.page, item.gpu_idx.slot, &bytes);
                drop(bytes);
                let _ = self.try_transition(item.gpu_idx, GpuStatus::Uploading, GpuStatus::Ready);
            } else {
                log::debug!(target: "gpu_cache", "tile {:?} cancelled before its GPU upload completed", item.code);
            }
            cpu_cache.release(item.cpu_idx);
        }
    }

    pub fn bind_textures(&self, base_unit: u32) {
        let page_count = self.table.lock().pages.len() as u32;
        for page in 0..page_count {
            self.sink.bind_texture_array(page, base_unit + page);
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().map.len()
    }
}

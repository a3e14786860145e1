//! Generic paged LRU table: a bounded keyed store of opaque entries, each
//! carrying a single atomic 64-bit state word, backed by fixed-size pages.
//!
//! The table's bookkeeping (`map`, `lru`, `open_pages`, `pages`) is not
//! internally synchronized beyond the `Mutex` wrapping it — the contract is
//! that only one thread (the render/owning thread) ever calls `load`,
//! evicts, or grows pages. Workers only touch the per-entry atomic state
//! word and the bytes of their reserved slot, never this bookkeeping.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// One of the five CPU-side cache statuses. The GPU cache defines its own
/// parallel enum in `gpu_cache` since its status set differs (no refs, an
/// UPLOADING state instead of LOADING).
///
/// `Unknown` carries any byte outside the five defined statuses. No code path
/// in this crate ever stores such a byte, but `unpack` must still be total
/// over all 64 bits of the atomic word so the raw byte round-trips through
/// `pack`/`unpack` instead of panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Empty,
    Ready,
    Loading,
    Queued,
    Cancelled,
    Unknown(u8),
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Empty,
            1 => Status::Ready,
            2 => Status::Loading,
            3 => Status::Queued,
            4 => Status::Cancelled,
            other => Status::Unknown(other),
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Status::Empty => 0,
            Status::Ready => 1,
            Status::Loading => 2,
            Status::Queued => 3,
            Status::Cancelled => 4,
            Status::Unknown(v) => v,
        }
    }
}

/// Unpacked view of the 64-bit atomic state word: `status(8) | flags(8) | gen(16) | refs(32)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub status: Status,
    pub flags: u8,
    pub gen: u16,
    pub refs: u32,
}

const STATUS_SHIFT: u32 = 0;
const FLAGS_SHIFT: u32 = 8;
const GEN_SHIFT: u32 = 16;
const REFS_SHIFT: u32 = 32;

impl State {
    pub const fn new(status: Status, gen: u16, refs: u32) -> Self {
        Self {
            status,
            flags: 0,
            gen,
            refs,
        }
    }

    pub const fn pack(self) -> u64 {
        ((self.status.to_u8() as u64) << STATUS_SHIFT)
            | ((self.flags as u64) << FLAGS_SHIFT)
            | ((self.gen as u64) << GEN_SHIFT)
            | ((self.refs as u64) << REFS_SHIFT)
    }

    pub fn unpack(bits: u64) -> Self {
        Self {
            status: Status::from_u8(((bits >> STATUS_SHIFT) & 0xFF) as u8),
            flags: ((bits >> FLAGS_SHIFT) & 0xFF) as u8,
            gen: ((bits >> GEN_SHIFT) & 0xFFFF) as u16,
            refs: ((bits >> REFS_SHIFT) & 0xFFFF_FFFF) as u32,
        }
    }
}

/// Atomic handle to one entry's state word, shared between the owning thread
/// and whichever worker is producing its contents.
pub struct AtomicState(AtomicU64);

impl AtomicState {
    pub fn new(state: State) -> Self {
        Self(AtomicU64::new(state.pack()))
    }

    pub fn load(&self, order: Ordering) -> State {
        State::unpack(self.0.load(order))
    }

    pub fn store(&self, state: State, order: Ordering) {
        self.0.store(state.pack(), order);
    }

    pub fn compare_exchange(
        &self,
        current: State,
        new: State,
        success: Ordering,
        failure: Ordering,
    ) -> Result<State, State> {
        self.0
            .compare_exchange(current.pack(), new.pack(), success, failure)
            .map(State::unpack)
            .map_err(State::unpack)
    }
}

/// `(page, slot)` index into the table. `PctIndex::NONE` means "no index".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PctIndex {
    pub page: u32,
    pub ent: u32,
}

impl PctIndex {
    pub const NONE: PctIndex = PctIndex {
        page: u32::MAX,
        ent: u32::MAX,
    };

    pub fn is_valid(self) -> bool {
        self != Self::NONE
    }
}

pub struct Entry {
    pub key: u64,
    pub state: AtomicState,
}

/// One fixed-capacity page: `page_size` entries plus caller-owned backing storage.
pub struct Page<B> {
    pub backing: B,
    pub entries: Vec<Entry>,
    pub free_list: Vec<u32>,
}

impl<B> Page<B> {
    fn new(page_size: usize, backing: B) -> Self {
        let mut entries = Vec::with_capacity(page_size);
        for _ in 0..page_size {
            entries.push(Entry {
                key: 0,
                state: AtomicState::new(State::new(Status::Empty, 0, 0)),
            });
        }
        let free_list: Vec<u32> = (0..page_size as u32).rev().collect();
        Self {
            backing,
            entries,
            free_list,
        }
    }
}

pub struct LoadResult {
    pub idx: PctIndex,
    pub needs_load: bool,
    pub is_ready: bool,
}

/// Generic bounded, paged, LRU keyed table. `B` is the page's opaque backing
/// resource (a byte buffer for the CPU cache, a texture array for the GPU cache).
pub struct PagedTable<B> {
    pages: Vec<Page<B>>,
    lru: VecDeque<PctIndex>,
    map: HashMap<u64, PctIndex>,
    open_pages: BinaryHeap<Reverse<u32>>,
    page_size: usize,
    capacity: usize,
    make_page: Box<dyn Fn() -> B + Send>,
}

impl<B> PagedTable<B> {
    pub fn new(capacity: usize, page_size: usize, make_page: Box<dyn Fn() -> B + Send>) -> Self {
        assert!(page_size > 0, "page_size must be > 0");
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            pages: Vec::new(),
            lru: VecDeque::new(),
            map: HashMap::new(),
            open_pages: BinaryHeap::new(),
            page_size,
            capacity,
            make_page,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn page(&self, page: u32) -> &Page<B> {
        &self.pages[page as usize]
    }

    pub fn page_mut(&mut self, page: u32) -> &mut Page<B> {
        &mut self.pages[page as usize]
    }

    pub fn entry(&self, idx: PctIndex) -> &Entry {
        &self.pages[idx.page as usize].entries[idx.ent as usize]
    }

    fn touch_front(&mut self, idx: PctIndex) {
        if let Some(pos) = self.lru.iter().position(|&i| i == idx) {
            self.lru.remove(pos);
        }
        self.lru.push_front(idx);
    }

    /// Allocate a free slot, growing pages as needed up to
    /// `ceil(capacity/page_size)` pages. Returns `None` if every page is full
    /// and no further page may be created.
    fn allocate(&mut self) -> Option<PctIndex> {
        if self.open_pages.is_empty() {
            let max_pages = (self.capacity - 1) / self.page_size + 1;
            if self.pages.len() >= max_pages {
                return None;
            }
            let page_index = self.pages.len() as u32;
            self.pages
                .push(Page::new(self.page_size, (self.make_page)()));
            self.open_pages.push(Reverse(page_index));
        }

        let Reverse(page_index) = *self.open_pages.peek().unwrap();
        let page = &mut self.pages[page_index as usize];
        let ent = page
            .free_list
            .pop()
            .expect("open page must have a free slot");
        if page.free_list.is_empty() {
            self.open_pages.pop();
        }
        Some(PctIndex {
            page: page_index,
            ent,
        })
    }

    fn free_slot(&mut self, idx: PctIndex) {
        let page = &mut self.pages[idx.page as usize];
        if page.free_list.is_empty() {
            self.open_pages.push(Reverse(idx.page));
        }
        page.free_list.push(idx.ent);
    }

    /// Attempt to evict the LRU tail. Mutates `map`/`lru` only when the CAS
    /// to EMPTY actually succeeds; any other outcome leaves the table as it was.
    fn evict_one(&mut self) -> Option<PctIndex> {
        let &tail = self.lru.back()?;
        loop {
            let entry = self.entry(tail);
            let current = entry.state.load(Ordering::Acquire);
            if current.refs > 0 {
                return None;
            }
            match current.status {
                Status::Cancelled | Status::Unknown(_) => return None,
                Status::Loading | Status::Queued => {
                    let desired = State::new(Status::Cancelled, current.gen, current.refs);
                    match entry
                        .state
                        .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire)
                    {
                        Ok(_) => return None,
                        Err(_) => continue,
                    }
                }
                Status::Empty | Status::Ready => {
                    let desired = State::new(Status::Empty, current.gen.wrapping_add(1), 0);
                    match entry
                        .state
                        .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire)
                    {
                        Ok(_) => {
                            let key = self.entry(tail).key;
                            self.lru.pop_back();
                            self.map.remove(&key);
                            self.free_slot(tail);
                            return Some(tail);
                        }
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    /// Load-or-reserve a key. Never partially inserts a key it fails to
    /// finish installing: on any failure path the table is left exactly as
    /// it was before the call.
    pub fn load(&mut self, key: u64) -> LoadResult {
        if let Some(&idx) = self.map.get(&key) {
            self.touch_front(idx);
            let state = self.entry(idx).state.load(Ordering::Acquire);
            return LoadResult {
                idx,
                needs_load: state.status == Status::Empty,
                is_ready: state.status == Status::Ready,
            };
        }

        let idx = if self.map.len() >= self.capacity {
            match self.evict_one() {
                Some(idx) => idx,
                None => {
                    return LoadResult {
                        idx: PctIndex::NONE,
                        needs_load: false,
                        is_ready: false,
                    }
                }
            }
        } else {
            match self.allocate() {
                Some(idx) => idx,
                None => {
                    return LoadResult {
                        idx: PctIndex::NONE,
                        needs_load: false,
                        is_ready: false,
                    }
                }
            }
        };

        let prev_gen = self.entry(idx).state.load(Ordering::Acquire).gen;
        {
            let page = &mut self.pages[idx.page as usize];
            let entry = &mut page.entries[idx.ent as usize];
            entry.key = key;
            entry.state.store(
                State::new(Status::Empty, prev_gen.wrapping_add(1), 0),
                Ordering::Release,
            );
        }
        self.lru.push_front(idx);
        self.map.insert(key, idx);

        LoadResult {
            idx,
            needs_load: true,
            is_ready: false,
        }
    }

    pub fn acquire(&self, key: u64) -> Option<PctIndex> {
        let &idx = self.map.get(&key)?;
        let entry = self.entry(idx);
        loop {
            let current = entry.state.load(Ordering::Acquire);
            if current.status != Status::Ready {
                return None;
            }
            let desired = State::new(current.status, current.gen, current.refs + 1);
            match entry
                .state
                .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(idx),
                Err(_) => continue,
            }
        }
    }

    pub fn release(&self, idx: PctIndex) {
        let entry = self.entry(idx);
        loop {
            let current = entry.state.load(Ordering::Acquire);
            debug_assert!(current.refs > 0, "release on an entry with refs==0");
            let desired = State::new(current.status, current.gen, current.refs.saturating_sub(1));
            match entry
                .state
                .compare_exchange(current, desired, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }

    /// Splice an already-known index to the LRU head (used by `find_best`
    /// when an ancestor hit should count as the most-recently-used entry).
    pub fn touch(&mut self, idx: PctIndex) {
        self.touch_front(idx);
    }

    pub fn contains(&self, key: u64) -> bool {
        self.map.contains_key(&key)
    }

    pub fn get(&self, key: u64) -> Option<PctIndex> {
        self.map.get(&key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_table(capacity: usize, page_size: usize) -> PagedTable<Vec<u8>> {
        PagedTable::new(capacity, page_size, Box::new(|| vec![0u8; 1]))
    }

    fn mark_ready(t: &PagedTable<Vec<u8>>, key: u64) {
        let idx = t.get(key).unwrap();
        let entry = t.entry(idx);
        let cur = entry.state.load(Ordering::Acquire);
        entry
            .state
            .store(State::new(Status::Ready, cur.gen, cur.refs), Ordering::Release);
    }

    #[test]
    fn state_roundtrips_through_pack_unpack() {
        let cases = [
            State::new(Status::Empty, 0, 0),
            State::new(Status::Ready, 65535, u32::MAX),
            State::new(Status::Loading, 1, 7),
            State::new(Status::Queued, 42, 0),
            State::new(Status::Cancelled, 0, 3),
        ];
        for s in cases {
            assert_eq!(State::unpack(s.pack()), s);
        }
        for bits in [0u64, u64::MAX, 0xDEAD_BEEF, 0x1234_5678_9ABC] {
            assert_eq!(State::unpack(bits).pack(), bits);
        }
    }

    #[test]
    fn load_on_empty_table_needs_load() {
        let mut t = make_table(4, 2);
        let res = t.load(1);
        assert!(res.idx.is_valid());
        assert!(res.needs_load);
        assert!(!res.is_ready);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn second_load_while_empty_still_needs_load_but_same_slot() {
        let mut t = make_table(4, 2);
        let first = t.load(1);
        let second = t.load(1);
        assert_eq!(first.idx, second.idx);
        assert!(second.needs_load);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn load_while_queued_does_not_need_load() {
        let mut t = make_table(4, 2);
        let res = t.load(1);
        let entry = t.entry(res.idx);
        let cur = entry.state.load(Ordering::Acquire);
        entry
            .state
            .compare_exchange(
                cur,
                State::new(Status::Queued, cur.gen, cur.refs),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap();
        let second = t.load(1);
        assert!(!second.needs_load);
        assert!(!second.is_ready);
    }

    #[test]
    fn acquire_fails_unless_ready() {
        let mut t = make_table(4, 2);
        let res = t.load(1);
        assert!(t.acquire(1).is_none());

        let entry = t.entry(res.idx);
        let cur = entry.state.load(Ordering::Acquire);
        entry
            .state
            .store(State::new(Status::Ready, cur.gen, 0), Ordering::Release);

        let acquired = t.acquire(1).expect("should acquire ready entry");
        let state = t.entry(acquired).state.load(Ordering::Acquire);
        assert_eq!(state.refs, 1);
        t.release(acquired);
        let state = t.entry(acquired).state.load(Ordering::Acquire);
        assert_eq!(state.refs, 0);
    }

    #[test]
    fn eviction_under_pressure_evicts_lru_tail() {
        let mut t = make_table(2, 2);
        t.load(1);
        mark_ready(&t, 1);
        t.load(2);
        mark_ready(&t, 2);
        // touch 2 again so 1 is the true LRU tail
        t.load(2);

        let res = t.load(3);
        assert!(res.idx.is_valid());
        assert!(!t.contains(1));
        assert!(t.contains(2));
        assert!(t.contains(3));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn eviction_blocked_by_refcount_fails_and_leaves_table_untouched() {
        let mut t = make_table(2, 2);
        t.load(1);
        mark_ready(&t, 1);
        t.load(2);
        mark_ready(&t, 2);

        let held = t.acquire(1).unwrap();

        let res = t.load(3);
        assert!(!res.idx.is_valid());
        assert!(t.contains(1));
        assert!(t.contains(2));
        assert!(!t.contains(3));

        t.release(held);
        let res = t.load(3);
        assert!(res.idx.is_valid());
        assert!(!t.contains(1));
        assert!(t.contains(3));
    }

    #[test]
    fn evicting_queued_entry_cancels_rather_than_frees() {
        let mut t = make_table(1, 1);
        let res = t.load(1);
        let entry = t.entry(res.idx);
        let cur = entry.state.load(Ordering::Acquire);
        entry
            .state
            .store(State::new(Status::Queued, cur.gen, 0), Ordering::Release);

        let res2 = t.load(2);
        assert!(!res2.idx.is_valid(), "cancelling, not evicting, this round");
        assert!(t.contains(1));

        let state = t.entry(res.idx).state.load(Ordering::Acquire);
        assert_eq!(state.status, Status::Cancelled);

        // worker resets CANCELLED -> EMPTY
        let cur = t.entry(res.idx).state.load(Ordering::Acquire);
        t.entry(res.idx)
            .state
            .store(State::new(Status::Empty, cur.gen, 0), Ordering::Release);

        let res3 = t.load(2);
        assert!(res3.idx.is_valid());
        assert!(t.contains(2));
        assert!(!t.contains(1));
    }

    #[test]
    fn gen_increments_on_reuse() {
        let mut t = make_table(1, 1);
        let first = t.load(1);
        let gen0 = t.entry(first.idx).state.load(Ordering::Acquire).gen;
        mark_ready(&t, 1);

        let second = t.load(2);
        assert!(second.idx.is_valid());
        let gen1 = t.entry(second.idx).state.load(Ordering::Acquire).gen;
        assert_ne!(gen0, gen1);
    }

    #[test]
    fn capacity_never_exceeded() {
        let mut t = make_table(3, 1);
        for k in 0..3 {
            t.load(k);
            mark_ready(&t, k);
        }
        assert_eq!(t.len(), 3);
        t.load(99);
        assert!(t.len() <= 3);
    }

    #[test]
    fn reused_slot_keeps_correct_key_mapping() {
        let mut t = make_table(1, 1);
        t.load(1);
        mark_ready(&t, 1);
        t.load(2);
        assert!(t.contains(2));
        assert!(!t.contains(1));
        assert_eq!(t.len(), 1);
    }
}

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::RecipeMapConfig;
use crate::free_list::{LocalFreeList, SharedFreeList};
use crate::interval::Interval;
use crate::range_entry::RangeEntry;
use crate::recipe::{Recipe, UnwinderKind};
use crate::recipe_map::RecipeHandle;
use crate::recipe_tree::{RecipeNode, RecipeNodeFreeList};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Slots dropped because the range they pointed into was unmapped.
    pub purged: u64,
}

struct CacheSlot<R: Recipe> {
    address: u64,
    handle: RecipeHandle<R>,
}

/// The per-thread side of a [`RecipeMap`](crate::RecipeMap). This needs to be
/// created upfront with [`RecipeMap::new_thread_cache`](crate::RecipeMap::new_thread_cache),
/// and each lookup needs exclusive access to it.
///
/// It remembers the recipes for addresses it has seen before, keeps the
/// thread's free lists of tree nodes and range entries, and holds the unwind
/// context gimli needs for DWARF CFI evaluation.
pub struct ThreadCache<R: Recipe> {
    slots: [Box<[Option<CacheSlot<R>>]>; UnwinderKind::COUNT],
    pub(crate) nodes: RecipeNodeFreeList<R>,
    pub(crate) entries: LocalFreeList<Arc<RangeEntry<R>>>,
    pub(crate) chain: Vec<Box<RecipeNode<R>>>,
    pub(crate) unwind_context: Box<gimli::UnwindContext<usize>>,
    seen_generation: u64,
    stats: CacheStats,
}

impl<R: Recipe> ThreadCache<R> {
    pub(crate) fn new(
        config: &RecipeMapConfig,
        node_pool: Arc<SharedFreeList<Box<RecipeNode<R>>>>,
        entry_pool: Arc<SharedFreeList<Arc<RangeEntry<R>>>>,
        generation: u64,
    ) -> Self {
        let empty_slots = || (0..config.thread_cache_slots).map(|_| None).collect();
        Self {
            slots: [empty_slots(), empty_slots()],
            nodes: LocalFreeList::new(node_pool, config.free_list_batch),
            entries: LocalFreeList::new(entry_pool, config.free_list_batch),
            chain: Vec::new(),
            unwind_context: Box::new(gimli::UnwindContext::new()),
            seen_generation: generation,
            stats: CacheStats::default(),
        }
    }

    fn slot_index(&self, kind: UnwinderKind, address: u64) -> usize {
        (address % self.slots[kind.index()].len() as u64) as usize
    }

    pub fn get(&mut self, kind: UnwinderKind, address: u64) -> Option<RecipeHandle<R>> {
        let index = self.slot_index(kind, address);
        match &self.slots[kind.index()][index] {
            Some(slot) if slot.address == address => {
                self.stats.hits += 1;
                Some(slot.handle.clone())
            }
            _ => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, kind: UnwinderKind, address: u64, handle: RecipeHandle<R>) {
        let index = self.slot_index(kind, address);
        self.slots[kind.index()][index] = Some(CacheSlot { address, handle });
    }

    /// Drop every slot whose address, or whose function, lies in `[lo, hi)`.
    pub fn delete_range(&mut self, lo: u64, hi: u64) {
        let range = Interval::new(lo, hi.max(lo));
        let mut purged = 0;
        for slots in self.slots.iter_mut() {
            for slot in slots.iter_mut() {
                let stale = slot.as_ref().is_some_and(|s| {
                    let function = s.handle.function_interval();
                    range.contains(s.address)
                        || (function.start() < range.end() && range.start() < function.end())
                });
                if stale {
                    *slot = None;
                    purged += 1;
                }
            }
        }
        self.stats.purged += purged;
    }

    pub fn clear(&mut self) {
        let mut purged = 0;
        for slots in self.slots.iter_mut() {
            for slot in slots.iter_mut() {
                if slot.take().is_some() {
                    purged += 1;
                }
            }
        }
        self.stats.purged += purged;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Return nodes left in the scratch chain by an interrupted build.
    pub(crate) fn reclaim_chain(&mut self) {
        for node in self.chain.drain(..) {
            self.nodes.push(node);
        }
    }

    /// Forget whatever was unmapped since this cache last looked at `log`.
    pub(crate) fn catch_up(&mut self, log: &UnmapLog) {
        let current = log.generation();
        if current == self.seen_generation {
            return;
        }
        let Some(records) = log.records.try_lock() else {
            // The log is being written, possibly by the code we interrupted.
            self.clear();
            self.seen_generation = current;
            return;
        };
        let (Some(oldest), Some(newest)) = (records.front(), records.back()) else {
            drop(records);
            self.clear();
            self.seen_generation = current;
            return;
        };
        let newest_generation = newest.generation;
        if oldest.generation > self.seen_generation + 1 {
            drop(records);
            self.clear();
        } else {
            let seen = self.seen_generation;
            for record in records.iter().filter(|r| r.generation > seen) {
                self.delete_range(record.range.start(), record.range.end());
            }
            drop(records);
        }
        self.seen_generation = newest_generation;
    }
}

struct UnmapRecord {
    generation: u64,
    range: Interval,
}

/// The most recent unmapped ranges, each tagged with the generation its unmap
/// produced. Thread caches compare their last seen generation against it
/// before every lookup.
pub(crate) struct UnmapLog {
    generation: AtomicU64,
    records: spin::Mutex<VecDeque<UnmapRecord>>,
    capacity: usize,
}

impl UnmapLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            generation: AtomicU64::new(0),
            records: spin::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Log an unmapped range. Must be called after the range's entries have
    /// left the index. Returns the new generation.
    pub fn record(&self, range: Interval) -> u64 {
        let mut records = self.records.lock();
        let generation = self.generation.load(Ordering::Relaxed) + 1;
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(UnmapRecord { generation, range });
        self.generation.store(generation, Ordering::Release);
        generation
    }
}

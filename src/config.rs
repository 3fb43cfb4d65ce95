/// The tallest tower a range index skip list supports.
pub const MAX_SKIPLIST_HEIGHT: usize = 16;

/// Tuning knobs for a [`RecipeMap`](crate::RecipeMap).
///
/// The defaults match what a sampling profiler needs for a typical process:
/// a few thousand functions per unwinder kind, a handful of sampling threads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipeMapConfig {
    /// Height of the range index skip lists, clamped to `1..=MAX_SKIPLIST_HEIGHT`.
    pub skiplist_height: usize,
    /// How many free nodes move between a thread's free list and the shared
    /// free list in one transfer.
    pub free_list_batch: usize,
    /// Number of slots per unwinder kind in each thread's lookup cache.
    pub thread_cache_slots: usize,
    /// How many times a lookup polls an entry that another thread is building
    /// before giving up with [`LookupError::BuildTimedOut`](crate::LookupError::BuildTimedOut).
    /// `None` waits until the build finishes.
    pub spin_limit: Option<u64>,
    /// How many times a lookup tries to take a range index lock before giving
    /// up with [`LookupError::IndexBusy`](crate::LookupError::IndexBusy).
    /// Module map changes hold these locks, possibly on the looking-up thread.
    pub lock_attempts: usize,
    /// How many recent unmaps are remembered so that thread caches can purge
    /// exactly the unmapped ranges instead of clearing themselves.
    pub unmap_log_capacity: usize,
}

impl Default for RecipeMapConfig {
    fn default() -> Self {
        Self {
            skiplist_height: 8,
            free_list_batch: 10,
            thread_cache_slots: 509,
            spin_limit: None,
            lock_attempts: 1 << 12,
            unmap_log_capacity: 32,
        }
    }
}

impl RecipeMapConfig {
    pub fn with_skiplist_height(mut self, height: usize) -> Self {
        self.skiplist_height = height;
        self
    }

    pub fn with_free_list_batch(mut self, batch: usize) -> Self {
        self.free_list_batch = batch;
        self
    }

    pub fn with_thread_cache_slots(mut self, slots: usize) -> Self {
        self.thread_cache_slots = slots;
        self
    }

    pub fn with_spin_limit(mut self, spin_limit: Option<u64>) -> Self {
        self.spin_limit = spin_limit;
        self
    }

    pub fn with_lock_attempts(mut self, attempts: usize) -> Self {
        self.lock_attempts = attempts;
        self
    }

    pub fn with_unmap_log_capacity(mut self, capacity: usize) -> Self {
        self.unmap_log_capacity = capacity;
        self
    }

    /// The configuration with every value forced into its valid range.
    pub(crate) fn normalized(mut self) -> Self {
        self.skiplist_height = self.skiplist_height.clamp(1, MAX_SKIPLIST_HEIGHT);
        self.free_list_batch = self.free_list_batch.max(1);
        self.thread_cache_slots = self.thread_cache_slots.max(1);
        self.unmap_log_capacity = self.unmap_log_capacity.max(1);
        self.lock_attempts = self.lock_attempts.max(1);
        self
    }
}

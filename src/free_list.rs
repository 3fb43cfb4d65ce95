//! Two-tier free lists for recipe tree nodes and range entries.
//!
//! Each thread keeps its own [`LocalFreeList`] which it can use without any
//! synchronization. When it runs dry it grabs a batch from the process-wide
//! [`SharedFreeList`], and when it grows too large it hands a batch back. The
//! shared list is only ever try-locked from the lookup path, so a thread that is
//! interrupted by a sampling signal while holding the lock cannot deadlock the
//! signal handler.

use alloc::sync::Arc;
use alloc::vec::Vec;

pub struct SharedFreeList<T> {
    items: spin::Mutex<Vec<T>>,
}

impl<T> Default for SharedFreeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedFreeList<T> {
    pub fn new() -> Self {
        Self {
            items: spin::Mutex::new(Vec::new()),
        }
    }

    /// Return a single item. Used by code that has no thread-local list at hand,
    /// for example when entries are deleted during an unmap.
    pub fn push(&self, item: T) {
        self.items.lock().push(item);
    }

    /// Move up to `count` items into `dest`, if the lock can be taken without
    /// waiting. Returns the number of items moved.
    pub fn try_take_batch(&self, dest: &mut Vec<T>, count: usize) -> usize {
        let Some(mut items) = self.items.try_lock() else {
            return 0;
        };
        let n = count.min(items.len());
        let split = items.len() - n;
        dest.extend(items.drain(split..));
        n
    }

    /// Move `count` items from the end of `src` into the shared list.
    pub fn give_batch(&self, src: &mut Vec<T>, count: usize) {
        let n = count.min(src.len());
        let split = src.len() - n;
        self.items.lock().extend(src.drain(split..));
    }

    /// Like [`give_batch`](Self::give_batch), but leaves `src` untouched if the
    /// lock is busy. Returns whether the items were moved.
    pub fn try_give_batch(&self, src: &mut Vec<T>, count: usize) -> bool {
        let Some(mut items) = self.items.try_lock() else {
            return false;
        };
        let n = count.min(src.len());
        let split = src.len() - n;
        items.extend(src.drain(split..));
        true
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct LocalFreeList<T> {
    items: Vec<T>,
    shared: Arc<SharedFreeList<T>>,
    batch: usize,
}

impl<T> LocalFreeList<T> {
    pub fn new(shared: Arc<SharedFreeList<T>>, batch: usize) -> Self {
        Self {
            items: Vec::with_capacity(batch * 2),
            shared,
            batch: batch.max(1),
        }
    }

    /// Take an item, refilling from the shared list if this list is empty.
    /// Returns `None` if both lists are empty (or the shared list is busy);
    /// the caller then allocates a fresh item.
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            self.shared.try_take_batch(&mut self.items, self.batch);
        }
        self.items.pop()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        if self.items.len() > 2 * self.batch {
            // Keep the surplus if another thread holds the shared list; the
            // next push tries again.
            self.shared.try_give_batch(&mut self.items, self.batch);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn shared(&self) -> &Arc<SharedFreeList<T>> {
        &self.shared
    }
}

impl<T> Drop for LocalFreeList<T> {
    fn drop(&mut self) {
        // A thread going away gives its items back so other threads can use them.
        let n = self.items.len();
        if n > 0 {
            self.shared.give_batch(&mut self.items, n);
        }
    }
}

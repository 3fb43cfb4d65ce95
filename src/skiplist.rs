//! A concurrent skip list of non-overlapping intervals.
//!
//! Lookups and insertions run concurrently under a shared structure lock;
//! insertions link new towers with per-node locks, validate-then-link, and
//! publish a `fully_linked` flag once every level is in place. Bulk deletions
//! take the structure lock exclusively, so a node can be freed as soon as it
//! is unlinked: no reader can still be standing on it.
//!
//! The list is bracketed by a left and a right sentinel which are never
//! compared, returned or deleted.

use alloc::boxed::Box;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::cmp::Ordering;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering as MemOrdering};

use crate::config::MAX_SKIPLIST_HEIGHT;
use crate::interval::Interval;

/// A value stored in a [`SkipList`], ordered by the start of its interval.
pub trait IntervalKeyed: Clone {
    fn interval(&self) -> Interval;
}

struct Node<V> {
    value: V,
    nexts: Box<[AtomicPtr<Node<V>>]>,
    lock: spin::Mutex<()>,
    fully_linked: AtomicBool,
}

impl<V> Node<V> {
    fn alloc(value: V, height: usize, fully_linked: bool) -> *mut Node<V> {
        let nexts = (0..height)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Box::into_raw(Box::new(Node {
            value,
            nexts,
            lock: spin::Mutex::new(()),
            fully_linked: AtomicBool::new(fully_linked),
        }))
    }

    #[inline(always)]
    fn height(&self) -> usize {
        self.nexts.len()
    }

    #[inline(always)]
    fn next(&self, layer: usize) -> *mut Node<V> {
        self.nexts[layer].load(MemOrdering::Acquire)
    }

    /// Inserts publish `fully_linked` right after linking their top level.
    /// Returns false if that did not happen within `patience` polls.
    fn wait_linked(&self, patience: Option<usize>) -> bool {
        retry(patience, || self.fully_linked.load(MemOrdering::Acquire).then_some(())).is_some()
    }
}

/// Call `attempt` until it succeeds, at most `patience` times (at least
/// once), or forever if `patience` is `None`.
fn retry<T>(patience: Option<usize>, mut attempt: impl FnMut() -> Option<T>) -> Option<T> {
    let mut tries = 0;
    loop {
        if let Some(t) = attempt() {
            return Some(t);
        }
        tries += 1;
        if patience.is_some_and(|patience| tries >= patience) {
            return None;
        }
        core::hint::spin_loop();
    }
}

type Tower<V> = [*mut Node<V>; MAX_SKIPLIST_HEIGHT];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Search {
    /// Fill in predecessors and successors on every level.
    Full,
    /// Stop descending at the first level on which the target is found.
    EarlyExit,
}

/// A `try_` operation gave up because a lock it needed stayed taken, possibly
/// by the very thread it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListBusy;

/// The result of [`SkipList::insert`].
#[derive(Debug)]
pub struct Insertion<V> {
    /// The value now in the list at the inserted position: the inserted value
    /// itself, or the value that was already there.
    pub present: V,
    /// The inserted value, handed back because an entry with the same start,
    /// or one overlapping it, was already present.
    pub rejected: Option<V>,
}

pub struct SkipList<V> {
    head: *mut Node<V>,
    tail: *mut Node<V>,
    height: usize,
    structure: spin::RwLock<()>,
}

// Nodes are only dereferenced while the structure lock is held, and only freed
// while it is held exclusively.
unsafe impl<V: Send + Sync> Send for SkipList<V> {}
unsafe impl<V: Send + Sync> Sync for SkipList<V> {}

impl<V: IntervalKeyed> SkipList<V> {
    /// Create a list of the given height (clamped to `1..=MAX_SKIPLIST_HEIGHT`)
    /// holding only the two sentinels.
    pub fn new(height: usize, left_sentinel: V, right_sentinel: V) -> Self {
        let height = height.clamp(1, MAX_SKIPLIST_HEIGHT);
        let tail = Node::alloc(right_sentinel, height, true);
        let head = Node::alloc(left_sentinel, height, true);
        // Safety: `head` was just allocated and is not shared yet.
        for next in unsafe { (*head).nexts.iter() } {
            next.store(tail, MemOrdering::Relaxed);
        }
        Self {
            head,
            tail,
            height,
            structure: spin::RwLock::new(()),
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn random_height(&self) -> usize {
        let bits: u32 = rand::random();
        (bits.trailing_ones() as usize + 1).min(self.height)
    }

    /// Descend from the head. `cmp` says where a node's value lies relative
    /// to the target; the search moves right past `Less` nodes. Returns the
    /// highest level on which an `Equal` node was found, with the predecessor
    /// and successor on each visited level.
    ///
    /// The caller must hold the structure lock.
    fn find_helper(
        &self,
        cmp: impl Fn(&V) -> Ordering,
        search: Search,
    ) -> (Option<usize>, Tower<V>, Tower<V>) {
        let mut preds: Tower<V> = [ptr::null_mut(); MAX_SKIPLIST_HEIGHT];
        let mut succs: Tower<V> = [ptr::null_mut(); MAX_SKIPLIST_HEIGHT];
        let mut found = None;
        let mut pred = self.head;
        for layer in (0..self.height).rev() {
            // Safety: every node reachable from the head stays allocated while
            // the structure lock is held, and the right sentinel terminates
            // each level.
            unsafe {
                let mut curr = (*pred).next(layer);
                while curr != self.tail && cmp(&(*curr).value) == Ordering::Less {
                    pred = curr;
                    curr = (*curr).next(layer);
                }
                preds[layer] = pred;
                succs[layer] = curr;
                if found.is_none() && curr != self.tail && cmp(&(*curr).value) == Ordering::Equal {
                    found = Some(layer);
                    if search == Search::EarlyExit {
                        break;
                    }
                }
            }
        }
        (found, preds, succs)
    }

    fn find_by(
        &self,
        cmp: impl Fn(&V) -> Ordering,
        patience: Option<usize>,
    ) -> Result<Option<V>, ListBusy> {
        let _guard = retry(patience, || self.structure.try_read()).ok_or(ListBusy)?;
        let (found, _, succs) = self.find_helper(cmp, Search::EarlyExit);
        let Some(layer) = found else {
            return Ok(None);
        };
        // Safety: structure lock held.
        let node = unsafe { &*succs[layer] };
        if !node.wait_linked(patience) {
            return Err(ListBusy);
        }
        Ok(Some(node.value.clone()))
    }

    /// The value whose interval starts where `key` starts.
    pub fn find(&self, key: &Interval) -> Option<V> {
        let start = key.start();
        let cmp = |v: &V| v.interval().start().cmp(&start);
        loop {
            if let Ok(found) = self.find_by(&cmp, None) {
                return found;
            }
        }
    }

    /// The value whose interval contains `address`.
    pub fn find_inrange(&self, address: u64) -> Option<V> {
        let cmp = |v: &V| v.interval().locate(address);
        loop {
            if let Ok(found) = self.find_by(&cmp, None) {
                return found;
            }
        }
    }

    /// Like [`find_inrange`](SkipList::find_inrange), but gives up after
    /// `patience` attempts at each lock instead of waiting for it.
    pub fn try_find_inrange(&self, address: u64, patience: usize) -> Result<Option<V>, ListBusy> {
        self.find_by(|v| v.interval().locate(address), Some(patience))
    }

    /// Insert `value` unless an entry with the same start, or one overlapping
    /// its interval, is already present; in that case the present entry is
    /// returned and `value` is handed back.
    pub fn insert(&self, value: V) -> Insertion<V> {
        let top = self.random_height();
        let mut value = value;
        loop {
            match self.insert_at_height(value, top, None) {
                Ok(insertion) => return insertion,
                Err(handed_back) => value = handed_back,
            }
        }
    }

    /// Like [`insert`](SkipList::insert), but gives up after `patience`
    /// attempts at each lock and hands `value` back as the error.
    pub fn try_insert(&self, value: V, patience: usize) -> Result<Insertion<V>, V> {
        let top = self.random_height();
        self.insert_at_height(value, top, Some(patience))
    }

    fn insert_at_height(
        &self,
        value: V,
        top: usize,
        patience: Option<usize>,
    ) -> Result<Insertion<V>, V> {
        let interval = value.interval();
        let start = interval.start();
        let Some(_guard) = retry(patience, || self.structure.try_read()) else {
            return Err(value);
        };
        loop {
            let (found, preds, succs) =
                self.find_helper(|v| v.interval().start().cmp(&start), Search::Full);

            // Safety: all dereferences below happen under the structure lock.
            unsafe {
                let present = if let Some(layer) = found {
                    Some(succs[layer])
                } else if preds[0] != self.head && (*preds[0]).value.interval().end() > start {
                    Some(preds[0])
                } else if succs[0] != self.tail
                    && (*succs[0]).value.interval().start() < interval.end()
                {
                    Some(succs[0])
                } else {
                    None
                };
                if let Some(node) = present {
                    let node = &*node;
                    if !node.wait_linked(patience) {
                        return Err(value);
                    }
                    return Ok(Insertion {
                        present: node.value.clone(),
                        rejected: Some(value),
                    });
                }

                // Lock the distinct predecessors bottom-up and check that
                // nothing was linked in between since the search.
                let mut guards: ArrayVec<spin::MutexGuard<'_, ()>, MAX_SKIPLIST_HEIGHT> =
                    ArrayVec::new();
                let mut prev_pred = ptr::null_mut();
                let mut valid = true;
                for layer in 0..top {
                    let pred = preds[layer];
                    if pred != prev_pred {
                        let lock = &(*pred).lock;
                        match retry(patience, || lock.try_lock()) {
                            Some(guard) => guards.push(guard),
                            None => return Err(value),
                        }
                        prev_pred = pred;
                    }
                    if (*pred).next(layer) != succs[layer] {
                        valid = false;
                        break;
                    }
                }
                if !valid {
                    drop(guards);
                    continue;
                }

                let node = Node::alloc(value, top, false);
                for layer in 0..top {
                    (*node).nexts[layer].store(succs[layer], MemOrdering::Relaxed);
                }
                for layer in 0..top {
                    (*preds[layer]).nexts[layer].store(node, MemOrdering::Release);
                }
                (*node).fully_linked.store(true, MemOrdering::Release);
                drop(guards);
                return Ok(Insertion {
                    present: (*node).value.clone(),
                    rejected: None,
                });
            }
        }
    }

    /// Unlink the run of nodes after the last node for which `below` holds, up
    /// to the first node for which `within` fails, and pass their values to
    /// `free_fn` in ascending order. Returns the number of removed values.
    fn delete_run(
        &self,
        below: impl Fn(&V) -> bool,
        within: impl Fn(&V) -> bool,
        mut free_fn: impl FnMut(V),
    ) -> usize {
        let _guard = self.structure.write();
        let mut pred = self.head;
        let mut first = self.tail;
        // Safety: the structure lock is held exclusively; no reader or
        // inserter is inside the list.
        unsafe {
            for layer in (0..self.height).rev() {
                let mut curr = (*pred).next(layer);
                while curr != self.tail && below(&(*curr).value) {
                    pred = curr;
                    curr = (*curr).next(layer);
                }
                if layer == 0 {
                    first = curr;
                }
                let mut after = curr;
                while after != self.tail && within(&(*after).value) {
                    after = (*after).next(layer);
                }
                if after != curr {
                    (*pred).nexts[layer].store(after, MemOrdering::Release);
                }
            }

            let mut removed = 0;
            let mut curr = first;
            while curr != self.tail && within(&(*curr).value) {
                let node = Box::from_raw(curr);
                curr = node.next(0);
                let Node { value, .. } = *node;
                free_fn(value);
                removed += 1;
            }
            removed
        }
    }

    /// Remove every value whose start lies between the starts of `lo` and `hi`
    /// (both inclusive).
    pub fn delete_bulk(&self, lo: &Interval, hi: &Interval, free_fn: impl FnMut(V)) -> usize {
        let (lo, hi) = (lo.start(), hi.start());
        if lo > hi {
            return 0;
        }
        self.delete_run(
            |v| v.interval().start() < lo,
            |v| v.interval().start() <= hi,
            free_fn,
        )
    }

    /// Remove every value whose interval overlaps the addresses
    /// `lo_address..=hi_address`.
    pub fn delete_bulk_inrange(
        &self,
        lo_address: u64,
        hi_address: u64,
        free_fn: impl FnMut(V),
    ) -> usize {
        if lo_address > hi_address {
            return 0;
        }
        self.delete_run(
            |v| v.interval().end() <= lo_address,
            |v| v.interval().start() <= hi_address,
            free_fn,
        )
    }

    /// Visit every node, sentinels included, in ascending order together with
    /// its tower height.
    pub fn for_each(&self, mut f: impl FnMut(&V, usize)) {
        let _guard = self.structure.read();
        let mut curr = self.head;
        // Safety: structure lock held; the right sentinel's bottom link is null.
        unsafe {
            while !curr.is_null() {
                let node = &*curr;
                if node.fully_linked.load(MemOrdering::Acquire) {
                    f(&node.value, node.height());
                }
                curr = node.next(0);
            }
        }
    }

    /// Clones of all values between the sentinels, in ascending order.
    pub fn values(&self) -> Vec<V> {
        let mut values = Vec::new();
        let _guard = self.structure.read();
        // Safety: structure lock held.
        unsafe {
            let mut curr = (*self.head).next(0);
            while curr != self.tail {
                let node = &*curr;
                if node.fully_linked.load(MemOrdering::Acquire) {
                    values.push(node.value.clone());
                }
                curr = node.next(0);
            }
        }
        values
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
impl<V> SkipList<V> {
    /// Hold the structure lock the way a bulk delete does.
    pub(crate) fn lock_structure(&self) -> spin::RwLockWriteGuard<'_, ()> {
        self.structure.write()
    }
}

impl<V> Drop for SkipList<V> {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // Safety: `&mut self` means no other thread can reach the nodes;
            // each node is linked exactly once on the bottom level.
            let node = unsafe { Box::from_raw(curr) };
            curr = node.nexts[0].load(MemOrdering::Relaxed);
        }
    }
}

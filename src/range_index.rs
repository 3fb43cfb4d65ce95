use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::display_utils::{TowerLevels, TowerLinks};
use crate::interval::Interval;
use crate::range_entry::{EntrySnapshot, RangeEntry, Status};
use crate::recipe::{Recipe, UnwinderKind};
use crate::skiplist::{Insertion, IntervalKeyed, ListBusy, SkipList};

impl<R: Recipe> IntervalKeyed for Arc<RangeEntry<R>> {
    fn interval(&self) -> Interval {
        RangeEntry::interval(self)
    }
}

/// The address-space index of one unwinder kind: non-overlapping range
/// entries between the sentinels `[0, 0)` and `[u64::MAX, u64::MAX)`.
pub struct RangeIndex<R: Recipe> {
    kind: UnwinderKind,
    list: SkipList<Arc<RangeEntry<R>>>,
}

impl<R: Recipe> RangeIndex<R> {
    /// An index holding only the two sentinels. Callers poison the address
    /// space right after construction.
    pub fn new(kind: UnwinderKind, height: usize) -> Self {
        let left = Arc::new(RangeEntry::new(Interval::new(0, 0), None, Status::Never));
        let right = Arc::new(RangeEntry::new(
            Interval::new(u64::MAX, u64::MAX),
            None,
            Status::Never,
        ));
        Self {
            kind,
            list: SkipList::new(height, left, right),
        }
    }

    pub fn kind(&self) -> UnwinderKind {
        self.kind
    }

    pub fn find(&self, key: &Interval) -> Option<Arc<RangeEntry<R>>> {
        self.list.find(key)
    }

    pub fn find_inrange(&self, address: u64) -> Option<Arc<RangeEntry<R>>> {
        self.list.find_inrange(address)
    }

    pub fn insert(&self, entry: Arc<RangeEntry<R>>) -> Insertion<Arc<RangeEntry<R>>> {
        self.list.insert(entry)
    }

    /// The lookup path's version of [`find_inrange`](RangeIndex::find_inrange):
    /// it never waits for a lock, so it cannot deadlock against a map change
    /// that the calling thread interrupted.
    pub fn try_find_inrange(
        &self,
        address: u64,
        patience: usize,
    ) -> Result<Option<Arc<RangeEntry<R>>>, ListBusy> {
        self.list.try_find_inrange(address, patience)
    }

    /// The lookup path's version of [`insert`](RangeIndex::insert). Hands the
    /// entry back if the index stayed locked.
    pub fn try_insert(
        &self,
        entry: Arc<RangeEntry<R>>,
        patience: usize,
    ) -> Result<Insertion<Arc<RangeEntry<R>>>, Arc<RangeEntry<R>>> {
        self.list.try_insert(entry, patience)
    }

    #[cfg(test)]
    pub(crate) fn lock_structure(&self) -> spin::RwLockWriteGuard<'_, ()> {
        self.list.lock_structure()
    }

    pub fn delete_bulk(
        &self,
        lo: &Interval,
        hi: &Interval,
        free_fn: impl FnMut(Arc<RangeEntry<R>>),
    ) -> usize {
        self.list.delete_bulk(lo, hi, free_fn)
    }

    pub fn delete_bulk_inrange(
        &self,
        lo_address: u64,
        hi_address: u64,
        free_fn: impl FnMut(Arc<RangeEntry<R>>),
    ) -> usize {
        self.list.delete_bulk_inrange(lo_address, hi_address, free_fn)
    }

    /// The entries between the sentinels, in address order.
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.list.values().iter().map(|e| e.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Draw the skip list sideways: one tower per entry, followed by the
    /// entry and, if it is ready, its recipe tree.
    pub fn dump(&self) -> String {
        let max_height = self.list.height();
        let links = TowerLinks { max_height }.to_string();
        let tree_indent = format!("{links}    ");
        let mut out = String::new();
        let _ = writeln!(out, "{:?} range index:", self.kind);
        self.list.for_each(|entry, height| {
            let _ = writeln!(out, "{}{}", TowerLevels { height, max_height }, entry);
            if let Some(tree) = entry.tree() {
                let _ = tree.write_indented(&mut out, &tree_indent);
            }
            let _ = writeln!(out, "{links}");
        });
        out
    }
}

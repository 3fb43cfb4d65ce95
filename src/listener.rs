use tracing::{debug, trace, warn};

use crate::interval::Interval;
use crate::provider::{MapChangeListener, ModuleMapping};
use crate::range_entry::Status;
use crate::range_index::RangeIndex;
use crate::recipe::Recipe;
use crate::recipe_map::RecipeMap;

impl<R: Recipe, O, B> MapChangeListener for RecipeMap<R, O, B> {
    /// Carve the module's range out of the poisoned range around it. The
    /// module's functions get entries as they are looked up.
    fn on_map(&self, mapping: ModuleMapping) {
        let range = mapping.range;
        if range.is_empty() {
            warn!(module = %mapping.token, "ignoring empty module mapping");
            return;
        }
        debug!(module = %mapping.token, %range, "module mapped");
        for index in &self.indices {
            self.unpoison(index, mapping);
        }
    }

    /// Drop every entry inside the module's range and poison the range again,
    /// merged with adjacent poisoned ranges. Thread caches drop their stale
    /// slots on their next lookup.
    fn on_unmap(&self, mapping: ModuleMapping) {
        let range = mapping.range;
        if range.is_empty() {
            warn!(module = %mapping.token, "ignoring empty module unmapping");
            return;
        }
        for index in &self.indices {
            self.repoison(index, range);
        }
        let generation = self.unmap_log.record(range);
        debug!(module = %mapping.token, %range, generation, "module unmapped");
    }
}

impl<R: Recipe, O, B> RecipeMap<R, O, B> {
    fn unpoison(&self, index: &RangeIndex<R>, mapping: ModuleMapping) {
        let range = mapping.range;
        let Some(covering) = index.find_inrange(range.start()) else {
            warn!(kind = ?index.kind(), %range, "no entry covers the start of the mapped module");
            return;
        };
        let poisoned = covering.interval();
        if covering.status() != Status::Never || covering.module().is_some() {
            warn!(
                kind = ?index.kind(),
                module = %mapping.token,
                existing = %covering,
                "module mapped over a live range"
            );
            return;
        }
        if !poisoned.encloses(&range) {
            warn!(
                kind = ?index.kind(),
                module = %mapping.token,
                %poisoned,
                "module extends past the poisoned range it was mapped into"
            );
            return;
        }
        // The index must hold the only reference for the entry to be recycled.
        drop(covering);

        index.delete_bulk(&poisoned, &poisoned, |entry| self.recycle_entry(entry));
        self.poison(index, Interval::new(poisoned.start(), range.start()));
        self.poison(index, Interval::new(range.end(), poisoned.end()));
        trace!(kind = ?index.kind(), %range, "unpoisoned");
    }

    fn repoison(&self, index: &RangeIndex<R>, range: Interval) {
        let mut lo = range.start();
        let mut hi = range.end();
        let removed = index.delete_bulk_inrange(range.start(), range.end() - 1, |entry| {
            let interval = entry.interval();
            lo = lo.min(interval.start());
            hi = hi.max(interval.end());
            self.recycle_entry(entry);
        });

        if lo > 0 {
            if let Some(left) = index.find_inrange(lo - 1) {
                let interval = left.interval();
                if left.status() == Status::Never && left.module().is_none() && interval.end() == lo {
                    drop(left);
                    index.delete_bulk(&interval, &interval, |entry| self.recycle_entry(entry));
                    lo = interval.start();
                }
            }
        }
        if let Some(right) = index.find_inrange(hi) {
            let interval = right.interval();
            if right.status() == Status::Never && right.module().is_none() && interval.start() == hi {
                drop(right);
                index.delete_bulk(&interval, &interval, |entry| self.recycle_entry(entry));
                hi = interval.end();
            }
        }

        self.poison(index, Interval::new(lo, hi));
        trace!(
            kind = ?index.kind(),
            %range,
            removed,
            poisoned = %Interval::new(lo, hi),
            "repoisoned"
        );
    }
}

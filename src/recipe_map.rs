use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, trace, warn};

use crate::config::RecipeMapConfig;
use crate::error::{BuildError, LookupError};
use crate::free_list::SharedFreeList;
use crate::interval::Interval;
use crate::provider::{BuildRequest, FunctionBoundsOracle, IntervalBuilder, ModuleToken, RecipeSink};
use crate::range_entry::{BuildTicket, EntrySnapshot, RangeEntry, Status};
use crate::range_index::RangeIndex;
use crate::recipe::{Recipe, UnwinderKind};
use crate::recipe_tree::{RecipeNode, RecipeTree};
use crate::skiplist::ListBusy;
use crate::thread_cache::{ThreadCache, UnmapLog};

/// The result of a successful lookup: the recipe for one address, and the
/// range entry it came from.
///
/// A handle keeps its range entry alive, so it stays valid even if the module
/// is unmapped while the handle is held.
#[derive(Clone)]
pub struct RecipeHandle<R: Recipe> {
    entry: Arc<RangeEntry<R>>,
    interval: Interval,
    recipe: R,
}

impl<R: Recipe> RecipeHandle<R> {
    pub(crate) fn new(entry: Arc<RangeEntry<R>>, interval: Interval, recipe: R) -> Self {
        Self {
            entry,
            interval,
            recipe,
        }
    }

    pub fn recipe(&self) -> R {
        self.recipe
    }

    /// The sub-interval of the function that the recipe applies to.
    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn function_interval(&self) -> Interval {
        self.entry.interval()
    }

    pub fn module(&self) -> Option<ModuleToken> {
        self.entry.module()
    }

    pub fn entry(&self) -> &Arc<RangeEntry<R>> {
        &self.entry
    }

    /// Identifies the recipe tree the recipe was found in. Repeated lookups
    /// in the same function return the same id for as long as the function
    /// stays mapped.
    pub fn tree_id(&self) -> usize {
        self.entry
            .tree()
            .map_or(0, |tree| tree as *const RecipeTree<R> as usize)
    }
}

impl<R: Recipe> Debug for RecipeHandle<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecipeHandle")
            .field("interval", &self.interval)
            .field("recipe", &self.recipe)
            .field("function", &self.entry.interval())
            .field("module", &self.entry.module())
            .finish()
    }
}

/// Maps instruction addresses to unwind recipes, building the recipes for a
/// function the first time any address in it is looked up.
///
/// One map serves all threads. Each thread brings its own [`ThreadCache`],
/// created with [`new_thread_cache`](RecipeMap::new_thread_cache). Module
/// loads and unloads are reported through the
/// [`MapChangeListener`](crate::MapChangeListener) implementation.
pub struct RecipeMap<R: Recipe, O, B> {
    oracle: O,
    builder: B,
    config: RecipeMapConfig,
    pub(crate) indices: [RangeIndex<R>; UnwinderKind::COUNT],
    node_pool: Arc<SharedFreeList<Box<RecipeNode<R>>>>,
    entry_pool: Arc<SharedFreeList<Arc<RangeEntry<R>>>>,
    pub(crate) unmap_log: UnmapLog,
}

impl<R, O, B> RecipeMap<R, O, B>
where
    R: Recipe,
    O: FunctionBoundsOracle,
    B: IntervalBuilder<R>,
{
    pub fn new(oracle: O, builder: B) -> Self {
        Self::with_config(oracle, builder, RecipeMapConfig::default())
    }

    /// Create a map in which the entire address space is poisoned. Addresses
    /// become resolvable once the modules containing them are reported with
    /// [`on_map`](crate::MapChangeListener::on_map).
    pub fn with_config(oracle: O, builder: B, config: RecipeMapConfig) -> Self {
        let config = config.normalized();
        let indices = UnwinderKind::ALL.map(|kind| RangeIndex::new(kind, config.skiplist_height));
        let map = Self {
            oracle,
            builder,
            indices,
            node_pool: Arc::new(SharedFreeList::new()),
            entry_pool: Arc::new(SharedFreeList::new()),
            unmap_log: UnmapLog::new(config.unmap_log_capacity),
            config,
        };
        for index in &map.indices {
            map.poison(index, Interval::EVERYTHING);
        }
        debug!(config = ?map.config, "recipe map initialized");
        map
    }

    pub fn config(&self) -> &RecipeMapConfig {
        &self.config
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn range_index(&self, kind: UnwinderKind) -> &RangeIndex<R> {
        &self.indices[kind.index()]
    }

    /// Bumped by every unmap.
    pub fn unmap_generation(&self) -> u64 {
        self.unmap_log.generation()
    }

    pub fn new_thread_cache(&self) -> ThreadCache<R> {
        ThreadCache::new(
            &self.config,
            self.node_pool.clone(),
            self.entry_pool.clone(),
            self.unmap_log.generation(),
        )
    }

    /// Find the recipe for `address`, building the recipes of its function
    /// if no thread has done so yet.
    ///
    /// If another thread is building the same function, this waits for it
    /// (up to the configured spin limit).
    pub fn lookup(
        &self,
        address: u64,
        kind: UnwinderKind,
        cache: &mut ThreadCache<R>,
    ) -> Result<RecipeHandle<R>, LookupError> {
        cache.catch_up(&self.unmap_log);
        if let Some(handle) = cache.get(kind, address) {
            return Ok(handle);
        }

        let index = &self.indices[kind.index()];
        let entry = match self.find_entry(index, address)? {
            Some(entry) => entry,
            None => self.insert_function_entry(index, address, cache)?,
        };
        let tree = self.ensure_built(&entry, kind, address, cache)?;
        let handle = Self::handle_for(&entry, tree, address)?;
        cache.insert(kind, address, handle.clone());
        Ok(handle)
    }

    /// Like [`lookup`](RecipeMap::lookup), but never queries the oracle and
    /// never builds: returns [`LookupError::NotBuilt`] unless the recipes
    /// for `address` are already available.
    pub fn lookup_noinsert(
        &self,
        address: u64,
        kind: UnwinderKind,
        cache: &mut ThreadCache<R>,
    ) -> Result<RecipeHandle<R>, LookupError> {
        cache.catch_up(&self.unmap_log);
        if let Some(handle) = cache.get(kind, address) {
            return Ok(handle);
        }

        let entry = self
            .find_entry(&self.indices[kind.index()], address)?
            .ok_or(LookupError::NotBuilt(address))?;
        match entry.status() {
            Status::Never => Err(LookupError::Unresolvable(address)),
            Status::Deferred | Status::Forthcoming => Err(LookupError::NotBuilt(address)),
            Status::Ready => {
                let tree = entry.tree().ok_or(LookupError::NotBuilt(address))?;
                let handle = Self::handle_for(&entry, tree, address)?;
                cache.insert(kind, address, handle.clone());
                Ok(handle)
            }
        }
    }

    /// The entry containing `address`, without waiting on the index locks.
    /// Those may be held by a map change on this very thread.
    fn find_entry(
        &self,
        index: &RangeIndex<R>,
        address: u64,
    ) -> Result<Option<Arc<RangeEntry<R>>>, LookupError> {
        index
            .try_find_inrange(address, self.config.lock_attempts)
            .map_err(|ListBusy| {
                trace!(address = format_args!("{address:#x}"), "range index busy");
                LookupError::IndexBusy(address)
            })
    }

    fn handle_for(
        entry: &Arc<RangeEntry<R>>,
        tree: &RecipeTree<R>,
        address: u64,
    ) -> Result<RecipeHandle<R>, LookupError> {
        let node = tree
            .find(address)
            .ok_or(LookupError::NoRecipeForAddress(address))?;
        Ok(RecipeHandle::new(
            entry.clone(),
            node.interval(),
            node.recipe(),
        ))
    }

    /// Ask the oracle for the function around `address` and insert a
    /// `Deferred` entry for it, or get the entry some other thread inserted
    /// first.
    fn insert_function_entry(
        &self,
        index: &RangeIndex<R>,
        address: u64,
        cache: &mut ThreadCache<R>,
    ) -> Result<Arc<RangeEntry<R>>, LookupError> {
        let Some(bounds) = self.oracle.function_bounds(address) else {
            trace!(address = format_args!("{address:#x}"), "no function bounds");
            return Err(LookupError::NoFunctionBounds(address));
        };
        if !(bounds.start <= address && address < bounds.end) {
            debug!(
                address = format_args!("{address:#x}"),
                start = format_args!("{:#x}", bounds.start),
                end = format_args!("{:#x}", bounds.end),
                "address outside reported function bounds"
            );
            return Err(LookupError::OutsideFunctionBounds {
                address,
                start: bounds.start,
                end: bounds.end,
            });
        }

        let entry = self.alloc_entry(cache, bounds.interval(), bounds.module, Status::Deferred);
        let insertion = match index.try_insert(entry, self.config.lock_attempts) {
            Ok(insertion) => insertion,
            Err(entry) => {
                trace!(address = format_args!("{address:#x}"), "range index busy");
                cache.entries.push(entry);
                return Err(LookupError::IndexBusy(address));
            }
        };
        if let Some(rejected) = insertion.rejected {
            cache.entries.push(rejected);
        }
        let present = insertion.present;
        if !present.interval().contains(address) {
            warn!(
                address = format_args!("{address:#x}"),
                function = %bounds.interval(),
                existing = %present,
                "function bounds overlap an existing range"
            );
            return Err(LookupError::Unresolvable(address));
        }
        Ok(present)
    }

    /// Drive `entry` to a terminal state and return its tree.
    fn ensure_built<'e>(
        &self,
        entry: &'e RangeEntry<R>,
        kind: UnwinderKind,
        address: u64,
        cache: &mut ThreadCache<R>,
    ) -> Result<&'e RecipeTree<R>, LookupError> {
        loop {
            match entry.status() {
                Status::Ready => {
                    return entry
                        .tree()
                        .ok_or(LookupError::NoRecipeForAddress(address))
                }
                Status::Never => return Err(LookupError::Unresolvable(address)),
                Status::Deferred => {
                    if let Some(ticket) = entry.try_claim() {
                        return self.build(ticket, kind, cache);
                    }
                }
                Status::Forthcoming => {
                    if entry.wait_for_build(self.config.spin_limit).is_none() {
                        debug!(
                            address = format_args!("{address:#x}"),
                            function = %entry.interval(),
                            "gave up waiting for a concurrent build"
                        );
                        return Err(LookupError::BuildTimedOut(address));
                    }
                }
            }
        }
    }

    /// Run the decoder for the claimed entry. A decoder that fails or panics
    /// leaves the entry `Never`.
    fn build<'e>(
        &self,
        ticket: BuildTicket<'e, R>,
        kind: UnwinderKind,
        cache: &mut ThreadCache<R>,
    ) -> Result<&'e RecipeTree<R>, LookupError> {
        let entry = ticket.entry();
        let function = entry.interval();
        let request = BuildRequest {
            function,
            kind,
            module: entry.module(),
        };
        trace!(%function, ?kind, "building recipes");

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut sink = RecipeSink::new(
                function,
                &mut cache.chain,
                &mut cache.nodes,
                &mut cache.unwind_context,
            );
            match self.builder.build_intervals(&request, &mut sink) {
                Ok(()) => sink.finish(),
                Err(err) => {
                    sink.discard();
                    Err(err)
                }
            }
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                cache.reclaim_chain();
                Err(BuildError::Panicked)
            }
        };

        match result {
            Ok(tree) => {
                trace!(%function, ?kind, recipes = tree.len(), "recipes ready");
                Ok(ticket.publish(tree))
            }
            Err(source) => {
                warn!(%function, ?kind, %source, "building recipes failed");
                ticket.fail();
                Err(LookupError::BuildFailed {
                    start: function.start(),
                    end: function.end(),
                    source,
                })
            }
        }
    }

    /// Snapshot of the entries in the index of `kind`.
    pub fn entries(&self, kind: UnwinderKind) -> Vec<EntrySnapshot> {
        self.indices[kind.index()].entries()
    }

    /// A human-readable picture of the index of `kind`, including every
    /// recipe tree that has been built.
    pub fn dump(&self, kind: UnwinderKind) -> String {
        self.indices[kind.index()].dump()
    }
}

impl<R: Recipe, O, B> RecipeMap<R, O, B> {
    /// A fresh entry, recycled from the thread's free list when possible.
    fn alloc_entry(
        &self,
        cache: &mut ThreadCache<R>,
        interval: Interval,
        module: Option<ModuleToken>,
        status: Status,
    ) -> Arc<RangeEntry<R>> {
        while let Some(mut entry) = cache.entries.pop() {
            if let Some(e) = Arc::get_mut(&mut entry) {
                if let Some(tree) = e.reset(interval, module, status) {
                    tree.free(&mut cache.nodes);
                }
                return entry;
            }
        }
        Arc::new(RangeEntry::new(interval, module, status))
    }

    /// A fresh entry for callers without a thread cache.
    pub(crate) fn alloc_shared_entry(
        &self,
        interval: Interval,
        module: Option<ModuleToken>,
        status: Status,
    ) -> Arc<RangeEntry<R>> {
        let mut recycled = Vec::with_capacity(1);
        self.entry_pool.try_take_batch(&mut recycled, 1);
        if let Some(mut entry) = recycled.pop() {
            if let Some(e) = Arc::get_mut(&mut entry) {
                if let Some(tree) = e.reset(interval, module, status) {
                    tree.free_shared(&self.node_pool);
                }
                return entry;
            }
        }
        Arc::new(RangeEntry::new(interval, module, status))
    }

    /// Return an entry removed from an index to the shared pools. Entries
    /// still referenced by a [`RecipeHandle`] are left to their last owner.
    pub(crate) fn recycle_entry(&self, mut entry: Arc<RangeEntry<R>>) {
        let Some(e) = Arc::get_mut(&mut entry) else {
            return;
        };
        if let Some(tree) = e.take_tree() {
            tree.free_shared(&self.node_pool);
        }
        self.entry_pool.push(entry);
    }

    /// Insert a `Never` entry covering `interval`.
    pub(crate) fn poison(&self, index: &RangeIndex<R>, interval: Interval) {
        if interval.is_empty() {
            return;
        }
        let entry = self.alloc_shared_entry(interval, None, Status::Never);
        let insertion = index.insert(entry);
        match insertion.rejected {
            None => trace!(kind = ?index.kind(), %interval, "poisoned"),
            Some(rejected) => {
                warn!(
                    kind = ?index.kind(),
                    %interval,
                    existing = %insertion.present,
                    "could not poison range, it overlaps an existing entry"
                );
                self.recycle_entry(rejected);
            }
        }
    }
}

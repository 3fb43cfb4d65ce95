//! The seams between the recipe map and the rest of the profiler: who knows
//! function bounds, who decodes recipes, and who reports module loads.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Display;

use crate::error::BuildError;
use crate::interval::Interval;
use crate::recipe::{Recipe, UnwinderKind};
use crate::recipe_tree::{RecipeNode, RecipeNodeFreeList, RecipeTree};

/// Identifies a loaded module. Tokens are handed out by whoever tracks module
/// loads; the recipe map only stores and compares them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleToken(pub u64);

impl Display for ModuleToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// A module mapped into (or unmapped from) the address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleMapping {
    pub token: ModuleToken,
    pub range: Interval,
}

/// The extent of one function, as reported by a [`FunctionBoundsOracle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionBounds {
    pub start: u64,
    pub end: u64,
    pub module: Option<ModuleToken>,
}

impl FunctionBounds {
    pub fn interval(&self) -> Interval {
        Interval::new(self.start, self.end)
    }
}

pub trait FunctionBoundsOracle {
    /// The bounds of the function containing `address`, or `None` if they
    /// cannot be determined.
    fn function_bounds(&self, address: u64) -> Option<FunctionBounds>;
}

/// What a decoder is asked to produce recipes for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildRequest {
    pub function: Interval,
    pub kind: UnwinderKind,
    pub module: Option<ModuleToken>,
}

pub trait IntervalBuilder<R: Recipe> {
    /// Push recipes covering `request.function` into `sink`, in ascending
    /// address order. Called at most once per function and unwinder kind, on
    /// the thread that won the right to build.
    fn build_intervals(
        &self,
        request: &BuildRequest,
        sink: &mut RecipeSink<'_, R>,
    ) -> Result<(), BuildError>;
}

/// Receives module load and unload notifications.
pub trait MapChangeListener {
    fn on_map(&self, mapping: ModuleMapping);
    fn on_unmap(&self, mapping: ModuleMapping);
}

impl<T: FunctionBoundsOracle + ?Sized> FunctionBoundsOracle for Arc<T> {
    fn function_bounds(&self, address: u64) -> Option<FunctionBounds> {
        (**self).function_bounds(address)
    }
}

impl<R: Recipe, T: IntervalBuilder<R> + ?Sized> IntervalBuilder<R> for Arc<T> {
    fn build_intervals(
        &self,
        request: &BuildRequest,
        sink: &mut RecipeSink<'_, R>,
    ) -> Result<(), BuildError> {
        (**self).build_intervals(request, sink)
    }
}

/// Collects the recipes a decoder produces for one function.
///
/// Nodes come from the building thread's free list; the collected chain is
/// turned into a balanced [`RecipeTree`] once the decoder returns.
pub struct RecipeSink<'a, R: Recipe> {
    function: Interval,
    chain: &'a mut Vec<Box<RecipeNode<R>>>,
    nodes: &'a mut RecipeNodeFreeList<R>,
    unwind_context: &'a mut gimli::UnwindContext<usize>,
}

impl<'a, R: Recipe> RecipeSink<'a, R> {
    pub(crate) fn new(
        function: Interval,
        chain: &'a mut Vec<Box<RecipeNode<R>>>,
        nodes: &'a mut RecipeNodeFreeList<R>,
        unwind_context: &'a mut gimli::UnwindContext<usize>,
    ) -> Self {
        debug_assert!(chain.is_empty());
        Self {
            function,
            chain,
            nodes,
            unwind_context,
        }
    }

    /// The function being decoded.
    pub fn function(&self) -> Interval {
        self.function
    }

    /// Append the recipe for `interval`. Intervals must lie inside the
    /// function and follow each other in ascending order. Empty intervals
    /// are ignored.
    pub fn push(&mut self, interval: Interval, recipe: R) -> Result<(), BuildError> {
        if interval.is_empty() {
            return Ok(());
        }
        if !self.function.encloses(&interval) {
            return Err(BuildError::IntervalOutsideFunction);
        }
        if let Some(last) = self.chain.last() {
            if last.interval().end() > interval.start() {
                return Err(BuildError::UnorderedIntervals);
            }
        }
        self.chain
            .push(RecipeNode::alloc(self.nodes, interval, recipe));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Scratch space for evaluating DWARF CFI, reused across builds on the
    /// same thread.
    pub fn unwind_context(&mut self) -> &mut gimli::UnwindContext<usize> {
        self.unwind_context
    }

    pub(crate) fn finish(self) -> Result<RecipeTree<R>, BuildError> {
        if self.chain.is_empty() {
            return Err(BuildError::EmptyFunction);
        }
        Ok(RecipeTree::rebalance(self.chain))
    }

    /// Return everything collected so far to the free list.
    pub(crate) fn discard(self) {
        for node in self.chain.drain(..) {
            self.nodes.push(node);
        }
    }
}

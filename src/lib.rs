//! A concurrent map from instruction addresses to unwind recipes, for
//! sampling profilers that walk stacks from signal handlers.
//!
//! Recipes are decoded lazily, one function at a time, the first time any
//! address in the function is looked up. Lookups never take a blocking lock
//! on their fast path; a thread that finds another thread decoding the same
//! function waits for it instead of decoding twice.
//!
//! [`RecipeMap`] holds one [`RangeIndex`] per [`UnwinderKind`]. Addresses
//! outside reported modules are covered by "poisoned" entries and resolve to
//! [`LookupError::Unresolvable`]. Function bounds come from a
//! [`FunctionBoundsOracle`] and recipes from an [`IntervalBuilder`];
//! [`ModuleRegistry`] provides both for x86_64 code using `.eh_frame` and
//! prologue analysis.

extern crate alloc;

mod config;
mod display_utils;
mod dwarf;
mod error;
mod free_list;
mod interval;
mod listener;
mod module;
mod provider;
mod range_entry;
mod range_index;
mod recipe;
mod recipe_map;
mod recipe_tree;
mod skiplist;
mod thread_cache;
mod x86_64;

pub use config::{RecipeMapConfig, MAX_SKIPLIST_HEIGHT};
pub use dwarf::{build_dwarf_recipes, translate_row, ConversionError, FdeIndex, FdeRecord};
pub use error::{BuildError, LookupError, StepError};
pub use free_list::{LocalFreeList, SharedFreeList};
pub use interval::Interval;
pub use module::{Module, ModuleRegistry, ModuleSections};
pub use provider::{
    BuildRequest, FunctionBounds, FunctionBoundsOracle, IntervalBuilder, MapChangeListener,
    ModuleMapping, ModuleToken, RecipeSink,
};
pub use range_entry::{BuildTicket, EntrySnapshot, RangeEntry, Status};
pub use range_index::RangeIndex;
pub use recipe::{Recipe, UnwinderKind};
pub use recipe_map::{RecipeHandle, RecipeMap};
pub use recipe_tree::{RecipeNode, RecipeNodeFreeList, RecipeTree};
pub use skiplist::{Insertion, IntervalKeyed, ListBusy, SkipList};
pub use thread_cache::{CacheStats, ThreadCache};
pub use x86_64::*;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub type RecipeNative = RecipeX86_64;
        pub type RegsNative = RegsX86_64;
        pub type RecipeMapNative<O, B> = RecipeMap<RecipeX86_64, O, B>;
    }
}

use core::fmt::Debug;

/// An architecture-specific description of how to recover the caller's return
/// address, stack pointer and frame pointer at the addresses of one interval.
///
/// Recipes are produced once by an [`IntervalBuilder`](crate::IntervalBuilder)
/// and are read-only afterwards; they are small and `Copy` so that a lookup can
/// hand them out without keeping the recipe tree borrowed.
pub trait Recipe: Copy + Debug + Send + Sync + 'static {
    /// The recipe to use for an address whose unwind information could be
    /// read but not translated into a more specific recipe.
    fn fallback() -> Self;
}

/// The alternative unwinding strategies. Each kind has its own, independent
/// range index, so the same address can be ready for one kind and never
/// resolvable for another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnwinderKind {
    /// Recipes derived from DWARF call frame information.
    Dwarf,
    /// Recipes derived from instruction analysis of the function body.
    Native,
}

impl UnwinderKind {
    pub const COUNT: usize = 2;
    pub const ALL: [UnwinderKind; Self::COUNT] = [UnwinderKind::Dwarf, UnwinderKind::Native];

    #[inline(always)]
    pub fn index(self) -> usize {
        match self {
            UnwinderKind::Dwarf => 0,
            UnwinderKind::Native => 1,
        }
    }
}

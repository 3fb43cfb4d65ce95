#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    #[error("Address 0x{0:x} is in a range that can never be unwound")]
    Unresolvable(u64),

    #[error("Could not find the bounds of the function containing 0x{0:x}")]
    NoFunctionBounds(u64),

    #[error("Address 0x{address:x} is outside the bounds 0x{start:x}..0x{end:x} reported for its function")]
    OutsideFunctionBounds { address: u64, start: u64, end: u64 },

    #[error("Building unwind recipes for 0x{start:x}..0x{end:x} failed: {source}")]
    BuildFailed {
        start: u64,
        end: u64,
        #[source]
        source: BuildError,
    },

    #[error("No recipe covers address 0x{0:x}")]
    NoRecipeForAddress(u64),

    #[error("Unwind recipes for address 0x{0:x} have not been built yet")]
    NotBuilt(u64),

    #[error("Gave up waiting for another thread to build recipes for 0x{0:x}")]
    BuildTimedOut(u64),

    #[error("The range index was locked by a map change while looking up 0x{0:x}")]
    IndexBusy(u64),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    #[error("No unwind info for the function")]
    NoUnwindInfo,

    #[error("Reading DWARF CFI failed: {0}")]
    Gimli(#[from] gimli::Error),

    #[error("Recipe intervals were not emitted in ascending, non-overlapping order")]
    UnorderedIntervals,

    #[error("A recipe interval lies outside the function")]
    IntervalOutsideFunction,

    #[error("The decoder produced no recipes")]
    EmptyFunction,

    #[error("The decoder panicked")]
    Panicked,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepError {
    #[error("Could not read stack memory at 0x{0:x}")]
    CouldNotReadStack(u64),

    #[error("Frame pointer unwinding moved backwards")]
    FramepointerUnwindingMovedBackwards,

    #[error("Neither the code address nor the stack pointer changed, would loop")]
    DidNotAdvance,

    #[error("Arithmetic overflow")]
    IntegerOverflow,
}

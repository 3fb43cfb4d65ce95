use core::cell::UnsafeCell;
use core::fmt::{Debug, Display};
use core::sync::atomic::{AtomicU8, Ordering};

use crate::interval::Interval;
use crate::provider::ModuleToken;
use crate::recipe::Recipe;
use crate::recipe_tree::RecipeTree;

/// The build state of a [`RangeEntry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// The range can never be unwound: it is outside any mapped module, or
    /// building its recipes failed.
    Never = 0,
    /// The function bounds are known; nobody has started building recipes.
    Deferred = 1,
    /// Exactly one thread is building the recipe tree right now.
    Forthcoming = 2,
    /// The recipe tree is attached and immutable.
    Ready = 3,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            1 => Status::Deferred,
            2 => Status::Forthcoming,
            3 => Status::Ready,
            _ => Status::Never,
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Status::Never => "NEVER",
            Status::Deferred => "DEFERRED",
            Status::Forthcoming => "FORTHCOMING",
            Status::Ready => "READY",
        };
        write!(f, "{s:>11}")
    }
}

/// A function-sized (or, for poisoned ranges, arbitrarily large) address
/// range, the module it belongs to, and the state of its recipe tree.
pub struct RangeEntry<R> {
    interval: Interval,
    module: Option<ModuleToken>,
    status: AtomicU8,
    /// Written only by the thread holding the `Forthcoming` claim, before it
    /// release-stores `Ready`. Read only after an acquire load observed `Ready`.
    tree: UnsafeCell<Option<RecipeTree<R>>>,
}

// The tree is handed from the building thread to readers through the
// release/acquire pair on `status`; see `BuildTicket::publish` and `tree`.
unsafe impl<R: Send + Sync> Sync for RangeEntry<R> {}

impl<R: Recipe> RangeEntry<R> {
    pub fn new(interval: Interval, module: Option<ModuleToken>, status: Status) -> Self {
        Self {
            interval,
            module,
            status: AtomicU8::new(status as u8),
            tree: UnsafeCell::new(None),
        }
    }

    /// Reinitialize a recycled entry. Returns the tree it still held, if any.
    pub(crate) fn reset(
        &mut self,
        interval: Interval,
        module: Option<ModuleToken>,
        status: Status,
    ) -> Option<RecipeTree<R>> {
        self.interval = interval;
        self.module = module;
        *self.status.get_mut() = status as u8;
        self.tree.get_mut().take()
    }

    /// Take the tree out of an entry that is no longer shared.
    pub(crate) fn take_tree(&mut self) -> Option<RecipeTree<R>> {
        self.tree.get_mut().take()
    }

    #[inline(always)]
    pub fn interval(&self) -> Interval {
        self.interval
    }

    #[inline(always)]
    pub fn module(&self) -> Option<ModuleToken> {
        self.module
    }

    /// The current status, loaded with acquire ordering so that a `Ready`
    /// result makes the tree visible.
    #[inline]
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// The recipe tree, if the entry is `Ready`.
    #[inline]
    pub fn tree(&self) -> Option<&RecipeTree<R>> {
        if self.status() != Status::Ready {
            return None;
        }
        // Safety: `Ready` was observed with acquire ordering, and the tree was
        // written before the matching release store. Nobody writes the tree
        // again while the entry is shared.
        unsafe { (*self.tree.get()).as_ref() }
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            interval: self.interval,
            module: self.module,
            status: self.status(),
        }
    }

    /// Try to become the single builder of this entry's recipe tree
    /// (`Deferred → Forthcoming`). At most one caller ever gets a ticket.
    pub fn try_claim(&self) -> Option<BuildTicket<'_, R>> {
        self.status
            .compare_exchange(
                Status::Deferred as u8,
                Status::Forthcoming as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| BuildTicket {
                entry: self,
                finished: false,
            })
    }

    /// Poll the status while another thread builds the tree. Returns the
    /// status that ended the wait, or `None` if `spin_limit` polls passed
    /// without the build finishing.
    pub fn wait_for_build(&self, spin_limit: Option<u64>) -> Option<Status> {
        let mut backoff = Backoff::new();
        let mut polls: u64 = 0;
        loop {
            let status = self.status();
            if status != Status::Forthcoming {
                return Some(status);
            }
            polls += 1;
            if spin_limit.is_some_and(|limit| polls >= limit) {
                return None;
            }
            backoff.snooze();
        }
    }
}

impl<R> Debug for RangeEntry<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RangeEntry")
            .field("interval", &self.interval)
            .field("module", &self.module)
            .field("status", &Status::from_u8(self.status.load(Ordering::Relaxed)))
            .finish()
    }
}

impl<R> Display for RangeEntry<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let status = Status::from_u8(self.status.load(Ordering::Relaxed));
        match self.module {
            Some(module) => write!(f, "({} {} {})", self.interval, module, status),
            None => write!(f, "({} nil {})", self.interval, status),
        }
    }
}

/// A point-in-time copy of an entry's bookkeeping, without its tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub interval: Interval,
    pub module: Option<ModuleToken>,
    pub status: Status,
}

/// The right to build one entry's recipe tree. Dropping the ticket without
/// publishing, for example while unwinding out of a panicking decoder, marks
/// the entry `Never` so that waiting threads are released.
pub struct BuildTicket<'a, R: Recipe> {
    entry: &'a RangeEntry<R>,
    finished: bool,
}

impl<'a, R: Recipe> BuildTicket<'a, R> {
    pub fn entry(&self) -> &'a RangeEntry<R> {
        self.entry
    }

    /// Attach the finished tree and publish `Ready`.
    pub fn publish(mut self, tree: RecipeTree<R>) -> &'a RecipeTree<R> {
        let entry = self.entry;
        // Safety: holding the ticket means the status is `Forthcoming` and we
        // are the only thread that may touch the tree. Readers only look at it
        // after seeing `Ready`, which is stored below with release ordering.
        let published = unsafe {
            let slot = &mut *entry.tree.get();
            *slot = Some(tree);
            slot.as_ref()
        };
        entry.status.store(Status::Ready as u8, Ordering::Release);
        self.finished = true;
        match published {
            Some(tree) => tree,
            None => unreachable!("tree was just stored"),
        }
    }

    /// Give up: the range can never be unwound.
    pub fn fail(mut self) {
        self.entry
            .status
            .store(Status::Never as u8, Ordering::Release);
        self.finished = true;
    }
}

impl<R: Recipe> Drop for BuildTicket<'_, R> {
    fn drop(&mut self) {
        if !self.finished {
            self.entry
                .status
                .store(Status::Never as u8, Ordering::Release);
        }
    }
}

/// Exponential backoff for spin-waiting on a concurrent build.
struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    fn new() -> Self {
        Self { step: 0 }
    }

    fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..1 << self.step {
                core::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
        if self.step <= Self::YIELD_LIMIT {
            self.step += 1;
        }
    }
}

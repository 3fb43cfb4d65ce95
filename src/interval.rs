use core::cmp::Ordering;
use core::fmt::{Debug, Display};

use crate::display_utils::HexNum;

/// A half-open address range `[start, end)`.
///
/// Intervals stored side by side in a [`RangeIndex`](crate::RangeIndex) never
/// overlap, so ordering them by `start` alone is a total order for the index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interval {
    start: u64,
    end: u64,
}

impl Interval {
    /// The whole address space that can be described by an interval.
    pub const EVERYTHING: Interval = Interval {
        start: 0,
        end: u64::MAX,
    };

    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "interval start 0x{start:x} > end 0x{end:x}");
        Self { start, end }
    }

    #[inline(always)]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline(always)]
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Where does this interval lie relative to `address`?
    ///
    ///  - `Less`: the whole interval is below the address.
    ///  - `Equal`: the address is inside the interval.
    ///  - `Greater`: the interval starts above the address.
    ///
    /// `u64::MAX` is never inside an interval that also starts at `u64::MAX`;
    /// that interval is the right sentinel of the index and a search must stop
    /// in front of it.
    #[inline]
    pub fn locate(&self, address: u64) -> Ordering {
        if address < self.start || (address == u64::MAX && self.start == u64::MAX) {
            Ordering::Greater
        } else if self.end <= address {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }

    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        self.locate(address) == Ordering::Equal
    }

    /// Is `other` entirely inside this interval?
    pub fn encloses(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Interval {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start)
    }
}

impl From<core::ops::Range<u64>> for Interval {
    fn from(range: core::ops::Range<u64>) -> Self {
        Interval::new(range.start, range.end)
    }
}

impl Debug for Interval {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{:?}, {:?})", HexNum(self.start), HexNum(self.end))
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn locate_and_contains() {
        let i = Interval::new(0x1000, 0x2000);
        assert_eq!(i.locate(0xfff), Ordering::Greater);
        assert_eq!(i.locate(0x1000), Ordering::Equal);
        assert_eq!(i.locate(0x1fff), Ordering::Equal);
        assert_eq!(i.locate(0x2000), Ordering::Less);
        assert!(!Interval::new(0, 0).contains(0));
    }

    #[test]
    fn right_sentinel_never_matches() {
        let sentinel = Interval::new(u64::MAX, u64::MAX);
        assert_eq!(sentinel.locate(u64::MAX), Ordering::Greater);
        assert_eq!(Interval::EVERYTHING.locate(u64::MAX), Ordering::Less);
    }

    #[test]
    fn formatting() {
        assert_eq!(format!("{}", Interval::new(0x10, 0x20)), "[10, 20)");
    }

    proptest! {
        #[test]
        fn ordering_follows_start(a in 0u64..1000, b in 0u64..1000, la in 0u64..50, lb in 0u64..50) {
            let x = Interval::new(a, a + la);
            let y = Interval::new(b, b + lb);
            prop_assert_eq!(x.cmp(&y), a.cmp(&b));
        }

        #[test]
        fn locate_is_consistent_with_bounds(start in 0u64..1000, len in 0u64..100, addr in 0u64..1200) {
            let i = Interval::new(start, start + len);
            let expected = if addr < start {
                Ordering::Greater
            } else if addr >= start + len {
                Ordering::Less
            } else {
                Ordering::Equal
            };
            prop_assert_eq!(i.locate(addr), expected);
        }
    }
}

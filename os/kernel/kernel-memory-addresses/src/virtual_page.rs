use core::fmt;
use core::iter::FusedIterator;

use crate::PAGE_SHIFT;

/// Virtual page number: a user virtual address shifted right by [`PAGE_SHIFT`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPageNumber(u64);

impl VirtualPageNumber {
    #[inline]
    #[must_use]
    pub const fn new(vpn: u64) -> Self {
        Self(vpn)
    }

    /// Page number containing the virtual address `va`.
    #[inline]
    #[must_use]
    pub const fn containing(va: u64) -> Self {
        Self(va >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Base virtual address of this page.
    #[inline]
    #[must_use]
    pub const fn base_address(self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// First page of the next naturally aligned block of `span` pages.
    ///
    /// `span` must be a power of two.
    #[inline]
    #[must_use]
    pub const fn align_up_next(self, span: u64) -> Self {
        Self((self.0 | (span - 1)) + 1)
    }
}

impl fmt::Display for VirtualPageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for VirtualPageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vpn({:#x})", self.0)
    }
}

impl From<u64> for VirtualPageNumber {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Inclusive range of virtual pages `[start, end]`.
///
/// Ranges are never empty; `start <= end` is enforced by [`VirtualPageRange::new`].
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct VirtualPageRange {
    start: VirtualPageNumber,
    end: VirtualPageNumber,
}

impl VirtualPageRange {
    /// # Panics
    /// Panics if `end < start`.
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualPageNumber, end: VirtualPageNumber) -> Self {
        assert!(start.0 <= end.0, "inverted virtual page range");
        Self { start, end }
    }

    /// Range of `count` pages starting at `start`.
    ///
    /// # Panics
    /// Panics if `count` is zero.
    #[inline]
    #[must_use]
    pub const fn with_len(start: VirtualPageNumber, count: u64) -> Self {
        assert!(count > 0, "empty virtual page range");
        Self::new(start, VirtualPageNumber(start.0 + count - 1))
    }

    #[inline]
    #[must_use]
    pub const fn start(self) -> VirtualPageNumber {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(self) -> VirtualPageNumber {
        self.end
    }

    #[inline]
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(self) -> u64 {
        self.end.0 - self.start.0 + 1
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, vpn: VirtualPageNumber) -> bool {
        self.start.0 <= vpn.0 && vpn.0 <= self.end.0
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.start.0 <= other.end.0 && other.start.0 <= self.end.0
    }

    #[inline]
    #[must_use]
    pub const fn iter(self) -> VirtualPageRangeIter {
        VirtualPageRangeIter {
            next: self.start.0,
            end: self.end.0,
            done: false,
        }
    }
}

impl fmt::Debug for VirtualPageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..={:#x}]", self.start.0, self.end.0)
    }
}

impl IntoIterator for VirtualPageRange {
    type Item = VirtualPageNumber;
    type IntoIter = VirtualPageRangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct VirtualPageRangeIter {
    next: u64,
    end: u64,
    done: bool,
}

impl Iterator for VirtualPageRangeIter {
    type Item = VirtualPageNumber;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let vpn = self.next;
        if vpn == self.end {
            self.done = true;
        } else {
            self.next += 1;
        }
        Some(VirtualPageNumber(vpn))
    }
}

impl FusedIterator for VirtualPageRangeIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_next_skips_to_boundary() {
        let vpn = VirtualPageNumber::new(0x201);
        assert_eq!(vpn.align_up_next(0x200), VirtualPageNumber::new(0x400));
        assert_eq!(
            VirtualPageNumber::new(0x200).align_up_next(0x200),
            VirtualPageNumber::new(0x400)
        );
    }

    #[test]
    fn range_iterates_inclusive() {
        let range = VirtualPageRange::new(VirtualPageNumber::new(5), VirtualPageNumber::new(7));
        let pages: Vec<u64> = range.iter().map(VirtualPageNumber::as_u64).collect();
        assert_eq!(pages, vec![5, 6, 7]);
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = VirtualPageRange::with_len(VirtualPageNumber::new(0), 4);
        let b = VirtualPageRange::with_len(VirtualPageNumber::new(3), 4);
        let c = VirtualPageRange::with_len(VirtualPageNumber::new(4), 4);
        assert!(a.overlaps(b) && b.overlaps(a));
        assert!(!a.overlaps(c));
    }
}

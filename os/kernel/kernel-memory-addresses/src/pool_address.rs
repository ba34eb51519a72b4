use core::fmt;

use crate::PAGE_SHIFT;

/// Byte address inside system pool.
///
/// Prototype PTEs point at pool addresses: either into a section's
/// prototype array or into a fork's clone block store.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PoolAddress(u64);

impl PoolAddress {
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> PoolPage {
        PoolPage(self.0 >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Byte distance from `base`, or `None` if `self` lies below it.
    #[inline]
    #[must_use]
    pub const fn offset_from(self, base: Self) -> Option<u64> {
        self.0.checked_sub(base.0)
    }
}

impl fmt::Display for PoolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018X}", self.0)
    }
}

impl fmt::Debug for PoolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolAddress({:#018X})", self.0)
    }
}

/// Page of system pool, identified by its page number.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PoolPage(u64);

impl PoolPage {
    #[inline]
    #[must_use]
    pub const fn base(self) -> PoolAddress {
        PoolAddress(self.0 << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Pages touched by the byte range `[base, base + bytes)`.
    #[must_use]
    pub fn span(base: PoolAddress, bytes: u64) -> impl Iterator<Item = Self> {
        let first = base.0 >> PAGE_SHIFT;
        let last = (base.0 + bytes.max(1) - 1) >> PAGE_SHIFT;
        (first..=last).map(Self)
    }
}

impl fmt::Debug for PoolPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolPage({:#018X})", self.0 << PAGE_SHIFT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_covers_partial_pages() {
        let base = PoolAddress::new(0x1FF0);
        let pages: Vec<PoolPage> = PoolPage::span(base, 0x20).collect();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].base(), PoolAddress::new(0x1000));
        assert_eq!(pages[1].base(), PoolAddress::new(0x2000));
    }

    #[test]
    fn offset_from_rejects_lower_addresses() {
        let base = PoolAddress::new(0x2000);
        assert_eq!(PoolAddress::new(0x2010).offset_from(base), Some(0x10));
        assert_eq!(PoolAddress::new(0x1000).offset_from(base), None);
    }
}

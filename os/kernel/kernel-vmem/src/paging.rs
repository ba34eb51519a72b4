//! # Paging Modes
//!
//! The hierarchy is described level by level, leaf first:
//!
//! | Level | Table | Entries point at |
//! |-------|-------|------------------|
//! | 1 | page table | data pages (PTEs) |
//! | 2 | page directory | page tables (PDEs) |
//! | 3 | page-directory parent | page directories (PPEs) |
//! | 4 | extended parent | page-directory parents (PXEs) |
//!
//! The root table of a [`PagingMode`] sits at level [`PagingMode::levels`].

use kernel_memory_addresses::{PageFrameNumber, VirtualPageNumber};

/// Number of paging levels and their widths.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum PagingMode {
    /// Two levels of 1024 entries (classic 32-bit).
    TwoLevel,
    /// Three levels: 512-entry tables under a 4-entry root (PAE).
    ThreeLevel,
    /// Four levels of 512 entries.
    #[default]
    FourLevel,
}

/// Level of the leaf page table.
pub const LEAF_LEVEL: u8 = 1;

impl PagingMode {
    #[inline]
    #[must_use]
    pub const fn levels(self) -> u8 {
        match self {
            Self::TwoLevel => 2,
            Self::ThreeLevel => 3,
            Self::FourLevel => 4,
        }
    }

    /// Index width of a table at `level`.
    #[inline]
    #[must_use]
    pub const fn index_bits(self, level: u8) -> u32 {
        match (self, level) {
            (Self::TwoLevel, _) => 10,
            (Self::ThreeLevel, 3) => 2,
            (Self::ThreeLevel | Self::FourLevel, _) => 9,
        }
    }

    /// Number of entries in a table at `level`.
    #[inline]
    #[must_use]
    pub const fn entries(self, level: u8) -> usize {
        1 << self.index_bits(level)
    }

    /// Number of VPN bits translated below `level`.
    #[inline]
    #[must_use]
    pub const fn shift(self, level: u8) -> u32 {
        let mut shift = 0;
        let mut l = LEAF_LEVEL;
        while l < level {
            shift += self.index_bits(l);
            l += 1;
        }
        shift
    }

    /// Number of virtual pages covered by one entry of a table at `level`.
    #[inline]
    #[must_use]
    pub const fn span(self, level: u8) -> u64 {
        1 << self.shift(level)
    }

    /// Index of `vpn` within its table at `level`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self, vpn: VirtualPageNumber, level: u8) -> usize {
        ((vpn.as_u64() >> self.shift(level)) as usize) & (self.entries(level) - 1)
    }

    /// Highest virtual page number addressable in this mode.
    #[inline]
    #[must_use]
    pub const fn highest_vpn(self) -> VirtualPageNumber {
        let top = self.levels();
        VirtualPageNumber::new((1 << (self.shift(top) + self.index_bits(top))) - 1)
    }
}

/// One slot of a paging structure: the table frame and the index inside it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryLocation {
    pub table: PageFrameNumber,
    pub index: usize,
}

impl EntryLocation {
    #[inline]
    #[must_use]
    pub const fn new(table: PageFrameNumber, index: usize) -> Self {
        Self { table, index }
    }

    /// Slot for `vpn` in the table at `level` stored in `table`.
    #[inline]
    #[must_use]
    pub const fn of(mode: PagingMode, table: PageFrameNumber, vpn: VirtualPageNumber, level: u8) -> Self {
        Self::new(table, mode.index(vpn, level))
    }
}

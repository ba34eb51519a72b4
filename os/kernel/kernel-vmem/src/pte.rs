//! # Page Table Entries
//!
//! The memory manager stores every paging-structure entry as a [`PteBits`]
//! word and decodes it into a [`Pte`] when it needs to branch on the state.
//!
//! ## Bit layout
//!
//! | Bits   | Name             | Meaning |
//! |--------|------------------|---------|
//! | 0      | `valid`          | Entry maps a frame (or the next table) |
//! | 1      | `writable`       | Valid entries: writes allowed |
//! | 2      | `owner`          | User-mode accessible |
//! | 3      | `copy_on_write`  | Valid entries: a write must copy the page |
//! | 4      | `large_page`     | Directory entry maps a large page directly |
//! | 5      | `prototype`      | Invalid entry indirects through a prototype PTE |
//! | 6      | `transition`     | Invalid entry whose frame is still resident |
//! | 7–11   | `protection`     | Software protection code, see [`Protection`] |
//! | 12–59  | `payload`        | Frame number, prototype address / 8, or paging-file offset |
//! | 60–63  | reserved         | Zero |
//!
//! An all-zero word is the [`Pte::Zero`] state. A word with neither `valid`,
//! `prototype` nor `transition` set but a non-zero value is in paging-file
//! form; a zero payload there means demand-zero.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PageFrameNumber, PoolAddress};

/// Raw paging-structure entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq, Hash)]
pub struct PteBits {
    /// Valid (bit 0).
    pub valid: bool,
    /// Writable (bit 1); meaningful for valid entries only.
    pub writable: bool,
    /// Owner (bit 2): user-mode accessible.
    pub owner: bool,
    /// Copy-on-write (bit 3).
    pub copy_on_write: bool,
    /// Large page (bit 4): directory entry is a leaf mapping.
    pub large_page: bool,
    /// Prototype (bit 5); meaningful for invalid entries only.
    pub prototype: bool,
    /// Transition (bit 6); meaningful for invalid entries only.
    pub transition: bool,
    /// Protection code (bits 7..=11).
    #[bits(5)]
    protection_bits: u8,
    /// Payload (bits 12..=59).
    #[bits(48)]
    payload: u64,
    #[bits(4)]
    __reserved: u8,
}

impl PteBits {
    pub const ZERO: Self = Self::new();

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.into_bits() == 0
    }

    #[inline]
    #[must_use]
    pub const fn protection(self) -> Protection {
        Protection::from_bits(self.protection_bits())
    }

    #[inline]
    #[must_use]
    pub const fn with_protection(self, protection: Protection) -> Self {
        self.with_protection_bits(protection.bits())
    }

    /// Frame named by a valid or transition entry.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PageFrameNumber {
        PageFrameNumber::new(self.payload())
    }

    /// A valid entry mapping `frame`.
    #[inline]
    #[must_use]
    pub const fn valid_frame(frame: PageFrameNumber, protection: Protection) -> Self {
        Self::new()
            .with_valid(true)
            .with_owner(true)
            .with_writable(protection.is_writable())
            .with_protection(protection)
            .with_payload(frame.as_u64())
    }

    /// A valid directory entry pointing at the next-level table in `frame`.
    #[inline]
    #[must_use]
    pub const fn table(frame: PageFrameNumber) -> Self {
        Self::new()
            .with_valid(true)
            .with_writable(true)
            .with_owner(true)
            .with_payload(frame.as_u64())
    }

    /// A transition entry: `frame` is resident but not mapped.
    #[inline]
    #[must_use]
    pub const fn transition_frame(frame: PageFrameNumber, protection: Protection) -> Self {
        Self::new()
            .with_transition(true)
            .with_protection(protection)
            .with_payload(frame.as_u64())
    }

    /// A prototype entry pointing at the prototype PTE stored at `proto`.
    ///
    /// The protection field is left empty: the protection of the prototype applies.
    #[inline]
    #[must_use]
    pub const fn prototype_at(proto: PoolAddress) -> Self {
        Self::new()
            .with_prototype(true)
            .with_payload(proto.as_u64() >> 3)
    }

    /// A paging-file entry; `offset == 0` is demand-zero.
    #[inline]
    #[must_use]
    pub const fn paging_file(offset: u64, protection: Protection) -> Self {
        Self::new().with_protection(protection).with_payload(offset)
    }

    /// Decodes the active state.
    #[must_use]
    pub const fn decode(self) -> Pte {
        if self.valid() {
            Pte::Valid {
                frame: self.frame(),
                writable: self.writable(),
                copy_on_write: self.copy_on_write(),
                protection: self.protection(),
            }
        } else if self.prototype() {
            Pte::Prototype {
                proto: PoolAddress::new(self.payload() << 3),
            }
        } else if self.transition() {
            Pte::Transition {
                frame: self.frame(),
                protection: self.protection(),
            }
        } else if self.is_zero() {
            Pte::Zero
        } else {
            Pte::PageFile {
                offset: self.payload(),
                protection: self.protection(),
            }
        }
    }

    /// Write-protected copy-on-write variant of this entry.
    ///
    /// Valid entries lose write access and gain `copy_on_write`; every form
    /// has its protection turned into the write-copy variant.
    #[inline]
    #[must_use]
    pub const fn make_write_copy(self) -> Self {
        let copied = self.with_protection(self.protection().to_write_copy());
        if self.valid() {
            copied.with_writable(false).with_copy_on_write(true)
        } else {
            copied
        }
    }
}

/// Decoded view of a [`PteBits`] word.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Pte {
    Zero,
    Valid {
        frame: PageFrameNumber,
        writable: bool,
        copy_on_write: bool,
        protection: Protection,
    },
    Transition {
        frame: PageFrameNumber,
        protection: Protection,
    },
    Prototype {
        proto: PoolAddress,
    },
    PageFile {
        offset: u64,
        protection: Protection,
    },
}

impl Pte {
    /// Paging-file entry that needs no backing at all.
    #[inline]
    #[must_use]
    pub const fn is_decommitted(self) -> bool {
        matches!(self, Self::PageFile { protection, .. } if protection.is_decommitted())
    }

    /// Paging-file entry without an allocated slot.
    #[inline]
    #[must_use]
    pub const fn is_demand_zero(self) -> bool {
        matches!(self, Self::PageFile { offset: 0, .. })
    }
}

/// Software page protection code (5 bits).
///
/// The low three bits select the access kind, [`Protection::NOCACHE`] and
/// [`Protection::GUARD`] are modifiers. [`Protection::DECOMMIT`] marks
/// reserved-but-decommitted pages.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Protection(u8);

impl Protection {
    pub const NO_ACCESS: Self = Self(0);
    pub const READONLY: Self = Self(1);
    pub const EXECUTE: Self = Self(2);
    pub const EXECUTE_READ: Self = Self(3);
    pub const READWRITE: Self = Self(4);
    pub const WRITECOPY: Self = Self(5);
    pub const EXECUTE_READWRITE: Self = Self(6);
    pub const EXECUTE_WRITECOPY: Self = Self(7);
    pub const NOCACHE: Self = Self(0x08);
    pub const GUARD: Self = Self(0x10);
    pub const DECOMMIT: Self = Self(0x18);

    const ACCESS_MASK: u8 = 0x07;

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x1F)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_decommitted(self) -> bool {
        self.0 == Self::DECOMMIT.0
    }

    /// Read/write access (not write-copy).
    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        if self.is_decommitted() {
            return false;
        }
        let access = self.0 & Self::ACCESS_MASK;
        access == Self::READWRITE.0 || access == Self::EXECUTE_READWRITE.0
    }

    #[inline]
    #[must_use]
    pub const fn is_write_copy(self) -> bool {
        let access = self.0 & Self::ACCESS_MASK;
        access == Self::WRITECOPY.0 || access == Self::EXECUTE_WRITECOPY.0
    }

    /// Maps read/write access onto write-copy access, keeping modifiers.
    #[inline]
    #[must_use]
    pub const fn to_write_copy(self) -> Self {
        if !self.is_writable() {
            return self;
        }
        Self(self.0 + 1)
    }

    /// Access granted once a write-copy page has been copied.
    #[inline]
    #[must_use]
    pub const fn to_read_write(self) -> Self {
        if !self.is_write_copy() {
            return self;
        }
        Self(self.0 - 1)
    }
}

impl fmt::Debug for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Protection({:#04x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_word_decodes_to_zero() {
        assert_eq!(PteBits::ZERO.decode(), Pte::Zero);
    }

    #[test]
    fn demand_zero_is_not_zero() {
        let pte = PteBits::paging_file(0, Protection::READWRITE);
        assert!(!pte.is_zero());
        let decoded = pte.decode();
        assert!(decoded.is_demand_zero());
        assert!(!decoded.is_decommitted());
    }

    #[test]
    fn prototype_address_survives_encoding() {
        let proto = PoolAddress::new(0x5000_0000_2018);
        assert_eq!(
            PteBits::prototype_at(proto).decode(),
            Pte::Prototype { proto }
        );
    }

    #[test]
    fn write_copy_drops_write_access() {
        let frame = PageFrameNumber::new(42);
        let pte = PteBits::valid_frame(frame, Protection::READWRITE).make_write_copy();
        assert_eq!(
            pte.decode(),
            Pte::Valid {
                frame,
                writable: false,
                copy_on_write: true,
                protection: Protection::WRITECOPY,
            }
        );
    }

    #[test]
    fn write_copy_keeps_readonly_and_modifiers() {
        assert_eq!(Protection::READONLY.to_write_copy(), Protection::READONLY);
        let nocache_rw = Protection::from_bits(Protection::READWRITE.bits() | Protection::NOCACHE.bits());
        assert_eq!(
            nocache_rw.to_write_copy(),
            Protection::from_bits(Protection::WRITECOPY.bits() | Protection::NOCACHE.bits())
        );
        assert_eq!(
            Protection::EXECUTE_READWRITE.to_write_copy(),
            Protection::EXECUTE_WRITECOPY
        );
    }

    #[test]
    fn copied_page_regains_write_access() {
        assert_eq!(Protection::WRITECOPY.to_read_write(), Protection::READWRITE);
        assert_eq!(
            Protection::EXECUTE_WRITECOPY.to_read_write(),
            Protection::EXECUTE_READWRITE
        );
        assert_eq!(Protection::READONLY.to_read_write(), Protection::READONLY);
    }

    #[test]
    fn decommit_is_not_writable() {
        assert!(!Protection::DECOMMIT.is_writable());
        let pte = PteBits::paging_file(0, Protection::DECOMMIT).decode();
        assert!(pte.is_decommitted());
    }
}

//! # Page Frame Number Database
//!
//! One [`PfnEntry`] per physical frame. Frame 0 is never handed out.
//!
//! ## Counts
//!
//! * `share_count`: number of PTEs (or pins) referencing the frame while it
//!   is valid somewhere. Going from 0 to 1 takes a reference; dropping back
//!   to 0 releases it and moves the frame to the standby list.
//! * `reference_count`: outstanding references keeping the frame from being
//!   reused. A frame whose owning PTE was deleted is freed once its
//!   reference count reaches 0.
//!
//! Deleting a frame hands its original PTE, and with it any paging-file
//! slot, to the caller. A deleted frame has no paging-file backing left,
//! whichever path drops its last reference.
//!
//! Page-table pages carry their entries inline, so every PTE read and write
//! goes through this database and therefore through the PFN lock.

use crate::failure::{FailureInjector, FailurePlan};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{PageFrameNumber, PoolAddress, PoolPage};
use kernel_vmem::{EntryLocation, FrameAlloc, PageTableMemory, PteBits};
use log::trace;

/// List a frame currently sits on.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PageLocation {
    #[default]
    Free,
    /// Holds valid contents but no PTE maps it valid.
    Standby,
    Active,
}

/// Where the PTE mapping a frame lives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PteAddress {
    /// A slot in a page-table page.
    Table(EntryLocation),
    /// A prototype PTE in pool (section prototype or clone block).
    Prototype(PoolAddress),
}

/// Page holding the PTE that maps a frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PteFrame {
    Table(PageFrameNumber),
    Pool(PoolPage),
}

/// Back-reference from a frame to the PTE that owns it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PfnBacking {
    /// `None` once the owning PTE has been deleted.
    pub pte_address: Option<PteAddress>,
    /// Whether `pte_address` is a prototype PTE.
    pub prototype: bool,
    pub pte_frame: Option<PteFrame>,
    /// PTE contents to restore when the frame is taken away.
    pub original_pte: PteBits,
}

#[derive(Debug, Default)]
pub struct PfnEntry {
    pub share_count: u32,
    pub reference_count: u32,
    pub location: PageLocation,
    pub backing: PfnBacking,
    /// Non-zero entries of a page-table page.
    pub used_entries: u32,
    table: Option<Box<[PteBits]>>,
}

impl PfnEntry {
    #[must_use]
    pub const fn is_table(&self) -> bool {
        self.table.is_some()
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.backing.pte_address.is_none()
    }
}

pub struct PfnDatabase {
    entries: Vec<PfnEntry>,
    free: Vec<PageFrameNumber>,
    failures: FailureInjector,
}

impl PfnDatabase {
    /// Database of `pages` frames, numbered from 1, all free.
    #[must_use]
    pub fn new(pages: usize) -> Self {
        let mut entries = Vec::with_capacity(pages + 1);
        entries.resize_with(pages + 1, PfnEntry::default);
        let free = (1..=pages as u64).rev().map(PageFrameNumber::new).collect();
        Self {
            entries,
            free,
            failures: FailureInjector::default(),
        }
    }

    #[must_use]
    pub fn entry(&self, frame: PageFrameNumber) -> &PfnEntry {
        &self.entries[frame.as_index()]
    }

    pub fn entry_mut(&mut self, frame: PageFrameNumber) -> &mut PfnEntry {
        &mut self.entries[frame.as_index()]
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.entries.len() - 1
    }

    #[must_use]
    pub fn available_pages(&self) -> usize {
        self.free.len()
    }

    /// Frames currently not on the free list.
    #[must_use]
    pub fn pages_in_use(&self) -> usize {
        self.total_pages() - self.available_pages()
    }

    /// Makes upcoming page allocations fail according to `plan`.
    pub const fn inject_failures(&mut self, plan: FailurePlan) {
        self.failures.arm(plan);
    }

    pub const fn clear_failures(&mut self) {
        self.failures.disarm();
    }

    /// Detaches `frame` from its owning PTE; it is freed when the last
    /// reference goes away.
    ///
    /// Returns the original PTE and clears it. The caller releases any
    /// paging-file slot it names.
    #[must_use = "the original PTE may name a paging-file slot to release"]
    pub fn mark_deleted(&mut self, frame: PageFrameNumber) -> PteBits {
        let backing = &mut self.entry_mut(frame).backing;
        backing.pte_address = None;
        core::mem::replace(&mut backing.original_pte, PteBits::ZERO)
    }

    /// Drops one reference; a deleted frame is freed at zero. Its
    /// paging-file slot went to whoever called [`Self::mark_deleted`].
    pub fn decrement_reference_count(&mut self, frame: PageFrameNumber) {
        let entry = self.entry_mut(frame);
        debug_assert!(entry.reference_count > 0, "reference count underflow on {frame}");
        entry.reference_count = entry.reference_count.saturating_sub(1);
        if entry.reference_count == 0 && entry.is_deleted() {
            self.free_page(frame);
        }
    }

    fn table(&self, frame: PageFrameNumber) -> &[PteBits] {
        let Some(table) = self.entry(frame).table.as_deref() else {
            panic!("frame {frame} is not a page-table page");
        };
        table
    }

    fn table_mut(&mut self, frame: PageFrameNumber) -> &mut [PteBits] {
        let Some(table) = self.entry_mut(frame).table.as_deref_mut() else {
            panic!("frame {frame} is not a page-table page");
        };
        table
    }
}

impl FrameAlloc for PfnDatabase {
    fn allocate_page(&mut self, color: u32) -> Option<PageFrameNumber> {
        if self.failures.should_fail() {
            trace!("injected frame allocation failure");
            return None;
        }
        let frame = self.free.pop()?;
        let entry = self.entry_mut(frame);
        *entry = PfnEntry {
            location: PageLocation::Active,
            ..PfnEntry::default()
        };
        trace!("allocated frame {frame} (color {color})");
        Some(frame)
    }

    fn free_page(&mut self, frame: PageFrameNumber) {
        let entry = self.entry_mut(frame);
        debug_assert_ne!(entry.location, PageLocation::Free, "double free of {frame}");
        *entry = PfnEntry::default();
        self.free.push(frame);
    }
}

impl PageTableMemory for PfnDatabase {
    fn allocate_table(&mut self, entries: usize, color: u32) -> Option<PageFrameNumber> {
        let frame = self.allocate_page(color)?;
        self.entry_mut(frame).table = Some(vec![PteBits::ZERO; entries].into_boxed_slice());
        Some(frame)
    }

    fn link_table(&mut self, table: PageFrameNumber, owner: EntryLocation) {
        let entry = self.entry_mut(table);
        entry.share_count = 1;
        entry.reference_count = 1;
        entry.location = PageLocation::Active;
        entry.backing = PfnBacking {
            pte_address: Some(PteAddress::Table(owner)),
            prototype: false,
            pte_frame: Some(PteFrame::Table(owner.table)),
            original_pte: PteBits::ZERO,
        };
        self.increment_share_count(owner.table);
    }

    fn read(&self, at: EntryLocation) -> PteBits {
        self.table(at.table)[at.index]
    }

    fn write(&mut self, at: EntryLocation, pte: PteBits) {
        self.table_mut(at.table)[at.index] = pte;
    }

    fn increment_share_count(&mut self, frame: PageFrameNumber) {
        let entry = self.entry_mut(frame);
        if entry.share_count == 0 {
            entry.reference_count += 1;
            entry.location = PageLocation::Active;
        }
        entry.share_count += 1;
    }

    fn decrement_share_count(&mut self, frame: PageFrameNumber) {
        let entry = self.entry_mut(frame);
        debug_assert!(entry.share_count > 0, "share count underflow on {frame}");
        entry.share_count = entry.share_count.saturating_sub(1);
        if entry.share_count == 0 {
            entry.location = PageLocation::Standby;
            self.decrement_reference_count(frame);
        }
    }

    fn increment_used_entries(&mut self, table: PageFrameNumber) {
        self.entry_mut(table).used_entries += 1;
    }

    fn decrement_used_entries(&mut self, table: PageFrameNumber) {
        let entry = self.entry_mut(table);
        debug_assert!(entry.used_entries > 0, "used entries underflow on {table}");
        entry.used_entries = entry.used_entries.saturating_sub(1);
    }

    fn used_entries(&self, table: PageFrameNumber) -> u32 {
        self.entry(table).used_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::Protection;

    #[test]
    fn frames_are_numbered_from_one() {
        let mut db = PfnDatabase::new(2);
        assert_eq!(db.allocate_page(0), Some(PageFrameNumber::new(1)));
        assert_eq!(db.allocate_page(0), Some(PageFrameNumber::new(2)));
        assert_eq!(db.allocate_page(0), None);
        assert_eq!(db.pages_in_use(), 2);
    }

    #[test]
    fn share_count_drives_reference_count() {
        let mut db = PfnDatabase::new(4);
        let frame = db.allocate_page(0).unwrap();
        db.entry_mut(frame).backing.pte_address = Some(PteAddress::Prototype(PoolAddress::new(0x1000)));

        db.increment_share_count(frame);
        db.increment_share_count(frame);
        assert_eq!(db.entry(frame).reference_count, 1);

        db.decrement_share_count(frame);
        db.decrement_share_count(frame);
        let entry = db.entry(frame);
        assert_eq!(entry.reference_count, 0);
        assert_eq!(entry.location, PageLocation::Standby);
        assert_eq!(db.available_pages(), 3);
    }

    #[test]
    fn deleted_frame_is_freed_with_last_reference() {
        let mut db = PfnDatabase::new(4);
        let frame = db.allocate_page(0).unwrap();
        db.increment_share_count(frame);
        let _ = db.mark_deleted(frame);
        db.decrement_share_count(frame);
        assert_eq!(db.entry(frame).location, PageLocation::Free);
        assert_eq!(db.available_pages(), 4);
    }

    #[test]
    fn linked_table_pins_its_parent() {
        let mut db = PfnDatabase::new(4);
        let root = db.allocate_table(512, 0).unwrap();
        let child = db.allocate_table(512, 0).unwrap();
        db.link_table(child, EntryLocation::new(root, 7));

        assert_eq!(db.entry(root).share_count, 1);
        assert_eq!(db.entry(child).share_count, 1);
        assert_eq!(
            db.entry(child).backing.pte_frame,
            Some(PteFrame::Table(root))
        );

        db.write(EntryLocation::new(child, 3), PteBits::table(root));
        assert_eq!(db.read(EntryLocation::new(child, 3)), PteBits::table(root));
    }

    #[test]
    fn deleting_a_frame_hands_over_its_paging_file_slot() {
        let mut db = PfnDatabase::new(4);
        let frame = db.allocate_page(0).unwrap();
        let backed = PteBits::paging_file(9, Protection::READWRITE);
        db.entry_mut(frame).backing.original_pte = backed;
        db.increment_share_count(frame);
        // an extra reference outlives the owning PTE
        db.entry_mut(frame).reference_count += 1;

        assert_eq!(db.mark_deleted(frame), backed);
        assert_eq!(db.entry(frame).backing.original_pte, PteBits::ZERO);
        db.decrement_share_count(frame);
        assert_ne!(db.entry(frame).location, PageLocation::Free);
        db.decrement_reference_count(frame);
        assert_eq!(db.entry(frame).location, PageLocation::Free);
        assert_eq!(db.available_pages(), 4);
    }

    #[test]
    fn injected_failures_refuse_allocation() {
        let mut db = PfnDatabase::new(4);
        db.inject_failures(FailurePlan::transient(1));
        assert_eq!(db.allocate_page(0), None);
        assert!(db.allocate_page(0).is_some());
    }
}

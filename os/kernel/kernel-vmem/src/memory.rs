use crate::{EntryLocation, PteBits};
use kernel_memory_addresses::PageFrameNumber;

/// Minimal frame allocator interface.
pub trait FrameAlloc {
    /// Allocate one zeroed data page, preferring the given page color.
    fn allocate_page(&mut self, color: u32) -> Option<PageFrameNumber>;

    /// Return a frame to the free list.
    fn free_page(&mut self, frame: PageFrameNumber);
}

/// Access to page-table pages and their frame metadata.
///
/// Implemented by the PFN database; every call happens with the PFN lock held.
pub trait PageTableMemory: FrameAlloc {
    /// Allocate a zeroed page-table page of `entries` slots.
    fn allocate_table(&mut self, entries: usize, color: u32) -> Option<PageFrameNumber>;

    /// Initialise a freshly allocated table page that `owner` will point at.
    ///
    /// The page starts with a share and reference count of one, remembers
    /// `owner` as its PTE and `owner.table` as its containing frame, whose
    /// share count goes up by one.
    fn link_table(&mut self, table: PageFrameNumber, owner: EntryLocation);

    /// # Panics
    /// Implementations panic if `at.table` is not a page-table page.
    fn read(&self, at: EntryLocation) -> PteBits;

    /// # Panics
    /// Implementations panic if `at.table` is not a page-table page.
    fn write(&mut self, at: EntryLocation, pte: PteBits);

    fn increment_share_count(&mut self, frame: PageFrameNumber);
    fn decrement_share_count(&mut self, frame: PageFrameNumber);

    fn increment_used_entries(&mut self, table: PageFrameNumber);
    fn decrement_used_entries(&mut self, table: PageFrameNumber);
    fn used_entries(&self, table: PageFrameNumber) -> u32;
}

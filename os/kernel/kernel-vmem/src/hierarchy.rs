//! # Hierarchy Helpers
//!
//! Lookups and construction on one process's paging hierarchy, addressed by
//! its root table frame. Directory entries pointing at a table are either
//! valid or in transition (a page table built by fork that nobody touched
//! yet); both forms name the table frame.

use crate::{EntryLocation, LEAF_LEVEL, PageTableMemory, PagingMode, Protection, Pte, PteBits, WalkError};
use kernel_memory_addresses::{PageFrameNumber, VirtualPageNumber};

/// Result of looking up the leaf page table for a virtual page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LeafLookup {
    /// The page table exists.
    Present(PageFrameNumber),
    /// The entry at the table of `level` is absent, so is everything it would cover.
    Absent { level: u8 },
}

/// Table frame named by a directory entry, if it points at a table.
#[inline]
#[must_use]
pub const fn next_table(entry: PteBits) -> Option<PageFrameNumber> {
    match entry.decode() {
        Pte::Valid { frame, .. } if !entry.large_page() => Some(frame),
        Pte::Transition { frame, .. } => Some(frame),
        _ => None,
    }
}

/// Finds the page table holding `vpn` without changing anything.
pub fn find_leaf<M: PageTableMemory>(
    mem: &M,
    mode: PagingMode,
    root: PageFrameNumber,
    vpn: VirtualPageNumber,
) -> LeafLookup {
    let mut table = root;
    let mut level = mode.levels();
    while level > LEAF_LEVEL {
        match next_table(mem.read(EntryLocation::of(mode, table, vpn, level))) {
            Some(next) => table = next,
            None => return LeafLookup::Absent { level },
        }
        level -= 1;
    }
    LeafLookup::Present(table)
}

/// Finds the page table holding `vpn`, making transition directory entries
/// on the way valid again.
///
/// Each entry made valid takes a share count on the table it names. Nothing
/// here turns it back into a transition entry.
pub fn locate_leaf<M: PageTableMemory>(
    mem: &mut M,
    mode: PagingMode,
    root: PageFrameNumber,
    vpn: VirtualPageNumber,
) -> LeafLookup {
    let mut table = root;
    let mut level = mode.levels();
    while level > LEAF_LEVEL {
        let at = EntryLocation::of(mode, table, vpn, level);
        let entry = mem.read(at);
        let Some(next) = next_table(entry) else {
            return LeafLookup::Absent { level };
        };
        if entry.transition() {
            mem.write(at, PteBits::table(next));
            mem.increment_share_count(next);
        }
        table = next;
        level -= 1;
    }
    LeafLookup::Present(table)
}

/// Slot of the PTE for `vpn`, if its page table exists.
#[must_use]
pub fn pte_location<M: PageTableMemory>(
    mem: &M,
    mode: PagingMode,
    root: PageFrameNumber,
    vpn: VirtualPageNumber,
) -> Option<EntryLocation> {
    match find_leaf(mem, mode, root, vpn) {
        LeafLookup::Present(table) => Some(EntryLocation::of(mode, table, vpn, LEAF_LEVEL)),
        LeafLookup::Absent { .. } => None,
    }
}

/// PTE for `vpn`; zero when no page table covers it.
#[must_use]
pub fn read_pte<M: PageTableMemory>(
    mem: &M,
    mode: PagingMode,
    root: PageFrameNumber,
    vpn: VirtualPageNumber,
) -> PteBits {
    pte_location(mem, mode, root, vpn).map_or(PteBits::ZERO, |at| mem.read(at))
}

/// Frame mapped as a large page by the page directory entry covering `vpn`.
#[must_use]
pub fn large_page_frame<M: PageTableMemory>(
    mem: &M,
    mode: PagingMode,
    root: PageFrameNumber,
    vpn: VirtualPageNumber,
) -> Option<PageFrameNumber> {
    let mut table = root;
    let mut level = mode.levels();
    loop {
        let entry = mem.read(EntryLocation::of(mode, table, vpn, level));
        if level == LEAF_LEVEL + 1 {
            return (entry.valid() && entry.large_page()).then_some(entry.frame());
        }
        table = next_table(entry)?;
        level -= 1;
    }
}

/// Whether the page directory entry covering `vpn` maps a large page.
#[must_use]
pub fn maps_large_page<M: PageTableMemory>(
    mem: &M,
    mode: PagingMode,
    root: PageFrameNumber,
    vpn: VirtualPageNumber,
) -> bool {
    large_page_frame(mem, mode, root, vpn).is_some()
}

/// Returns the table at `target_level` covering `vpn`, building valid
/// directory entries for anything missing above it.
///
/// # Errors
/// [`WalkError::OutOfResources`] when a table page cannot be allocated.
pub fn ensure_table<M: PageTableMemory>(
    mem: &mut M,
    mode: PagingMode,
    root: PageFrameNumber,
    vpn: VirtualPageNumber,
    target_level: u8,
    color: u32,
) -> Result<PageFrameNumber, WalkError> {
    let mut table = root;
    let mut level = mode.levels();
    while level > target_level {
        let at = EntryLocation::of(mode, table, vpn, level);
        let entry = mem.read(at);
        table = match next_table(entry) {
            Some(next) => {
                if entry.transition() {
                    mem.write(at, PteBits::table(next));
                    mem.increment_share_count(next);
                }
                next
            }
            None => {
                let next = mem
                    .allocate_table(mode.entries(level - 1), color)
                    .ok_or(WalkError::OutOfResources)?;
                mem.link_table(next, at);
                mem.write(at, PteBits::table(next));
                mem.increment_used_entries(table);
                next
            }
        };
        level -= 1;
    }
    Ok(table)
}

/// Returns the slot of the PTE for `vpn`, building the hierarchy above it.
///
/// # Errors
/// [`WalkError::OutOfResources`] when a table page cannot be allocated.
pub fn ensure_pte<M: PageTableMemory>(
    mem: &mut M,
    mode: PagingMode,
    root: PageFrameNumber,
    vpn: VirtualPageNumber,
    color: u32,
) -> Result<EntryLocation, WalkError> {
    let table = ensure_table(mem, mode, root, vpn, LEAF_LEVEL, color)?;
    Ok(EntryLocation::of(mode, table, vpn, LEAF_LEVEL))
}

/// Maps `frame` as a large page through the page directory entry covering `vpn`.
///
/// # Errors
/// [`WalkError::OutOfResources`] when a directory page cannot be allocated.
pub fn map_large_page<M: PageTableMemory>(
    mem: &mut M,
    mode: PagingMode,
    root: PageFrameNumber,
    vpn: VirtualPageNumber,
    frame: PageFrameNumber,
    protection: Protection,
) -> Result<(), WalkError> {
    let directory = ensure_table(mem, mode, root, vpn, LEAF_LEVEL + 1, 0)?;
    let at = EntryLocation::of(mode, directory, vpn, LEAF_LEVEL + 1);
    if mem.read(at).is_zero() {
        mem.increment_used_entries(directory);
    }
    mem.write(at, PteBits::valid_frame(frame, protection).with_large_page(true));
    Ok(())
}

/// Frees every table page below `root` and clears the root's entries.
///
/// Data pages and large-page frames are not touched; the caller retires
/// them before tearing down the hierarchy. Returns the number of table
/// pages freed.
pub fn free_hierarchy<M: PageTableMemory>(mem: &mut M, mode: PagingMode, root: PageFrameNumber) -> usize {
    free_below(mem, mode, root, mode.levels())
}

fn free_below<M: PageTableMemory>(mem: &mut M, mode: PagingMode, table: PageFrameNumber, level: u8) -> usize {
    if level == LEAF_LEVEL {
        return 0;
    }
    let mut freed = 0;
    for index in 0..mode.entries(level) {
        let at = EntryLocation::new(table, index);
        let entry = mem.read(at);
        if entry.is_zero() {
            continue;
        }
        if let Some(child) = next_table(entry) {
            freed += free_below(mem, mode, child, level - 1);
            mem.free_page(child);
            freed += 1;
        }
        mem.write(at, PteBits::ZERO);
        mem.decrement_used_entries(table);
    }
    freed
}

//! # Fork Page-Table Walker
//!
//! Pairs every PTE of a source virtual range with the slot of the same
//! virtual page in a destination hierarchy, building destination tables as
//! it goes.
//!
//! ## Destination tables
//!
//! Directory pages above the page table are linked valid. A page table is
//! linked in transition form, initialised as owned by its directory entry,
//! and pinned with one share count while the walker is handing out its
//! slots. When the walker moves to another page table (or finishes), it
//! drops that share count, which leaves an untouched table on the standby
//! list until the destination process first uses it.
//!
//! ## Holes
//!
//! Whenever the walker crosses into a new source page table it looks the
//! table up from the root. An absent entry at any level skips the whole
//! range that entry would cover; no destination table is built for it.
//!
//! ```text
//!   source:  [PT a]  (absent PDE)  [PT c]
//!   slots:   a0..a511              c0..c511
//!   dest:    [PT a']               [PT c']
//! ```

use crate::hierarchy::{LeafLookup, locate_leaf, next_table};
use crate::{EntryLocation, LEAF_LEVEL, PageTableMemory, PagingMode, Protection, PteBits};
use kernel_memory_addresses::{PageFrameNumber, VirtualPageNumber, VirtualPageRange};
use log::trace;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WalkError {
    #[error("out of physical pages for a page-table page")]
    OutOfResources,
}

/// One step of the walk: the source PTE slot and its destination slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PteSlot {
    pub vpn: VirtualPageNumber,
    pub source: EntryLocation,
    pub destination: EntryLocation,
}

/// Lazy, forward-only walk over one virtual range.
///
/// The same slot is never handed out twice; a caller that needs to
/// reprocess a PTE keeps the [`PteSlot`] it already has.
pub struct PageTableWalker {
    mode: PagingMode,
    source_root: PageFrameNumber,
    destination_root: PageFrameNumber,
    next: Option<VirtualPageNumber>,
    last: VirtualPageNumber,
    source_table: Option<PageFrameNumber>,
    destination_table: Option<PageFrameNumber>,
    color: u32,
}

impl PageTableWalker {
    #[must_use]
    pub const fn new(
        mode: PagingMode,
        source_root: PageFrameNumber,
        destination_root: PageFrameNumber,
        range: VirtualPageRange,
        color: u32,
    ) -> Self {
        Self {
            mode,
            source_root,
            destination_root,
            next: Some(range.start()),
            last: range.end(),
            source_table: None,
            destination_table: None,
            color,
        }
    }

    /// Destination page table currently pinned by the walk.
    #[must_use]
    pub const fn destination_table(&self) -> Option<PageFrameNumber> {
        self.destination_table
    }

    /// Advances to the next PTE slot.
    ///
    /// Returns `Ok(None)` once the range is exhausted; the pinned
    /// destination table is released at that point.
    ///
    /// # Errors
    /// [`WalkError::OutOfResources`] when a destination table page cannot be
    /// allocated. The walk must not be resumed afterwards.
    pub fn next_slot<M: PageTableMemory>(&mut self, mem: &mut M) -> Result<Option<PteSlot>, WalkError> {
        loop {
            let Some(vpn) = self.next.filter(|vpn| *vpn <= self.last) else {
                self.finish(mem);
                return Ok(None);
            };

            if self.source_table.is_none() || self.mode.index(vpn, LEAF_LEVEL) == 0 {
                match locate_leaf(mem, self.mode, self.source_root, vpn) {
                    LeafLookup::Absent { level } => {
                        trace!("no level-{level} entry at {vpn}, skipping {} pages", self.mode.span(level));
                        self.source_table = None;
                        self.next = Some(vpn.align_up_next(self.mode.span(level)));
                        continue;
                    }
                    LeafLookup::Present(table) => {
                        self.source_table = Some(table);
                        let (destination, fresh) = self.destination_leaf(mem, vpn)?;
                        self.pin_destination(mem, destination, fresh);
                    }
                }
            }

            let (Some(source), Some(destination)) = (self.source_table, self.destination_table) else {
                // both are set together above
                continue;
            };
            self.next = Some(vpn.next());
            return Ok(Some(PteSlot {
                vpn,
                source: EntryLocation::of(self.mode, source, vpn, LEAF_LEVEL),
                destination: EntryLocation::of(self.mode, destination, vpn, LEAF_LEVEL),
            }));
        }
    }

    /// Ends the walk and drops the pin on the current destination table.
    pub fn finish<M: PageTableMemory>(&mut self, mem: &mut M) {
        self.next = None;
        self.source_table = None;
        if let Some(previous) = self.destination_table.take() {
            mem.decrement_share_count(previous);
        }
    }

    /// Finds or builds the destination page table for `vpn`.
    ///
    /// The flag is `true` for a page table built by this call.
    fn destination_leaf<M: PageTableMemory>(
        &self,
        mem: &mut M,
        vpn: VirtualPageNumber,
    ) -> Result<(PageFrameNumber, bool), WalkError> {
        let mut table = self.destination_root;
        let mut level = self.mode.levels();
        while level > LEAF_LEVEL {
            let at = EntryLocation::of(self.mode, table, vpn, level);
            if let Some(next) = next_table(mem.read(at)) {
                table = next;
                level -= 1;
                continue;
            }

            let next = mem
                .allocate_table(self.mode.entries(level - 1), self.color)
                .ok_or(WalkError::OutOfResources)?;
            mem.link_table(next, at);
            mem.increment_used_entries(table);

            if level == LEAF_LEVEL + 1 {
                mem.write(at, PteBits::transition_frame(next, Protection::READWRITE));
                return Ok((next, true));
            }
            mem.write(at, PteBits::table(next));
            table = next;
            level -= 1;
        }
        Ok((table, false))
    }

    fn pin_destination<M: PageTableMemory>(&mut self, mem: &mut M, table: PageFrameNumber, fresh: bool) {
        if self.destination_table == Some(table) {
            return;
        }
        if let Some(previous) = self.destination_table.replace(table) {
            mem.decrement_share_count(previous);
        }
        if !fresh {
            mem.increment_share_count(table);
        }
    }
}

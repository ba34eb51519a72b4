use crate::{EntryLocation, FrameAlloc, PageTableMemory, PagingMode, PteBits};
use kernel_memory_addresses::PageFrameNumber;
use std::collections::BTreeMap;

/// Page-table memory backed by plain maps, with an allocation budget.
pub struct TestMemory {
    pub tables: BTreeMap<PageFrameNumber, Vec<PteBits>>,
    share: BTreeMap<PageFrameNumber, u32>,
    used: BTreeMap<PageFrameNumber, u32>,
    next: u64,
    pub budget: usize,
}

impl TestMemory {
    pub fn new(budget: usize) -> Self {
        Self {
            tables: BTreeMap::new(),
            share: BTreeMap::new(),
            used: BTreeMap::new(),
            next: 1,
            budget,
        }
    }

    pub fn root(&mut self, mode: PagingMode) -> PageFrameNumber {
        self.allocate_table(mode.entries(mode.levels()), 0).unwrap()
    }

    pub fn share(&self, frame: PageFrameNumber) -> u32 {
        self.share.get(&frame).copied().unwrap_or(0)
    }
}

impl FrameAlloc for TestMemory {
    fn allocate_page(&mut self, _color: u32) -> Option<PageFrameNumber> {
        if self.budget == 0 {
            return None;
        }
        self.budget -= 1;
        let frame = PageFrameNumber::new(self.next);
        self.next += 1;
        Some(frame)
    }

    fn free_page(&mut self, frame: PageFrameNumber) {
        self.tables.remove(&frame);
    }
}

impl PageTableMemory for TestMemory {
    fn allocate_table(&mut self, entries: usize, color: u32) -> Option<PageFrameNumber> {
        let frame = self.allocate_page(color)?;
        self.tables.insert(frame, vec![PteBits::ZERO; entries]);
        Some(frame)
    }

    fn link_table(&mut self, table: PageFrameNumber, owner: EntryLocation) {
        self.share.insert(table, 1);
        *self.share.entry(owner.table).or_default() += 1;
    }

    fn read(&self, at: EntryLocation) -> PteBits {
        self.tables[&at.table][at.index]
    }

    fn write(&mut self, at: EntryLocation, pte: PteBits) {
        self.tables.get_mut(&at.table).unwrap()[at.index] = pte;
    }

    fn increment_share_count(&mut self, frame: PageFrameNumber) {
        *self.share.entry(frame).or_default() += 1;
    }

    fn decrement_share_count(&mut self, frame: PageFrameNumber) {
        *self.share.get_mut(&frame).unwrap() -= 1;
    }

    fn increment_used_entries(&mut self, table: PageFrameNumber) {
        *self.used.entry(table).or_default() += 1;
    }

    fn decrement_used_entries(&mut self, table: PageFrameNumber) {
        *self.used.get_mut(&table).unwrap() -= 1;
    }

    fn used_entries(&self, table: PageFrameNumber) -> u32 {
        self.used.get(&table).copied().unwrap_or(0)
    }
}

use alloc::collections::BTreeSet;

/// Slot allocator for the paging file. Offset 0 is never handed out; a
/// paging-file PTE with offset 0 is demand-zero.
#[derive(Debug)]
pub struct PagingFile {
    capacity: u64,
    allocated: BTreeSet<u64>,
    next_hint: u64,
}

impl PagingFile {
    #[must_use]
    pub const fn new(capacity: u64) -> Self {
        Self {
            capacity,
            allocated: BTreeSet::new(),
            next_hint: 1,
        }
    }

    pub fn allocate(&mut self) -> Option<u64> {
        if self.allocated.len() as u64 >= self.capacity {
            return None;
        }
        let mut offset = self.next_hint;
        while self.allocated.contains(&offset) {
            offset = if offset >= self.capacity { 1 } else { offset + 1 };
        }
        self.allocated.insert(offset);
        self.next_hint = if offset >= self.capacity { 1 } else { offset + 1 };
        Some(offset)
    }

    /// Releases the slot at `offset`; returns whether it was allocated.
    pub fn release(&mut self, offset: u64) -> bool {
        self.allocated.remove(&offset)
    }

    #[must_use]
    pub fn is_allocated(&self, offset: u64) -> bool {
        self.allocated.contains(&offset)
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_start_at_one_and_wrap() {
        let mut file = PagingFile::new(2);
        assert_eq!(file.allocate(), Some(1));
        assert_eq!(file.allocate(), Some(2));
        assert_eq!(file.allocate(), None);
        assert!(file.release(1));
        assert_eq!(file.allocate(), Some(1));
        assert!(!file.release(7));
    }
}

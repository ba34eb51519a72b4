use super::refcount::BlockRefCount;
use alloc::boxed::Box;
use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::PoolAddress;
use kernel_vmem::PteBits;

/// Pool bytes of one clone block.
pub const CLONE_BLOCK_SIZE: usize = size_of::<CloneBlock>();

/// One page shared copy-on-write by a fork: the PTE the page had in its
/// last private owner and the number of PTEs still naming the block.
#[derive(Debug)]
pub struct CloneBlock {
    saved: AtomicU64,
    refs: BlockRefCount,
}

impl CloneBlock {
    fn new(saved: PteBits) -> Self {
        Self {
            saved: AtomicU64::new(saved.into_bits()),
            refs: BlockRefCount::new(2),
        }
    }

    #[must_use]
    pub fn saved_pte(&self) -> PteBits {
        PteBits::from_bits(self.saved.load(Ordering::Acquire))
    }

    /// Updated under the PFN lock only.
    pub fn set_saved_pte(&self, pte: PteBits) {
        self.saved.store(pte.into_bits(), Ordering::Release);
    }

    #[must_use]
    pub const fn refs(&self) -> &BlockRefCount {
        &self.refs
    }
}

/// The clone blocks of one fork, laid out in one paged-pool allocation.
///
/// Blocks are appended and never reused; an index stays bound to its block
/// until the whole store is freed.
#[derive(Debug)]
pub struct CloneBlockStore {
    base: PoolAddress,
    blocks: Box<[Option<CloneBlock>]>,
    used: usize,
}

impl CloneBlockStore {
    /// Store for `capacity` blocks in the pool allocation at `base`.
    #[must_use]
    pub fn new(base: PoolAddress, capacity: usize) -> Self {
        let mut blocks = alloc::vec::Vec::with_capacity(capacity);
        blocks.resize_with(capacity, || None);
        Self {
            base,
            blocks: blocks.into_boxed_slice(),
            used: 0,
        }
    }

    #[must_use]
    pub const fn base(&self) -> PoolAddress {
        self.base
    }

    /// Blocks appended so far.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.used
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.blocks.len()
    }

    /// Pool bytes of the whole allocation.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.blocks.len() * CLONE_BLOCK_SIZE
    }

    /// Appends a block saving `saved` with a reference count of 2.
    ///
    /// Returns `None` when the store is full.
    pub fn append(&mut self, saved: PteBits) -> Option<PoolAddress> {
        let index = self.used;
        let slot = self.blocks.get_mut(index)?;
        *slot = Some(CloneBlock::new(saved));
        self.used += 1;
        Some(self.address_of(index))
    }

    #[must_use]
    pub const fn address_of(&self, index: usize) -> PoolAddress {
        self.base.add((index * CLONE_BLOCK_SIZE) as u64)
    }

    /// The block starting at `address`.
    #[must_use]
    pub fn block_at(&self, address: PoolAddress) -> Option<&CloneBlock> {
        let offset = usize::try_from(address.offset_from(self.base)?).ok()?;
        if offset % CLONE_BLOCK_SIZE != 0 {
            return None;
        }
        self.blocks.get(offset / CLONE_BLOCK_SIZE)?.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CloneBlock> {
        self.blocks.iter().flatten()
    }
}

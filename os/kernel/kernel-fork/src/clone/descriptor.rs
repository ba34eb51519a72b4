use super::block::{CLONE_BLOCK_SIZE, CloneBlock, CloneBlockStore};
use super::refcount::{DescriptorRefs, ProcessRefs};
use alloc::sync::Arc;
use core::mem::size_of;
use kernel_memory_addresses::PoolAddress;

/// Non-paged pool bytes of one clone header.
pub const CLONE_HEADER_SIZE: usize = size_of::<CloneHeader>();

/// Non-paged pool bytes of one clone descriptor.
pub const CLONE_DESCRIPTOR_SIZE: usize = size_of::<CloneDescriptor>();

/// Shared by every process descended from the fork that built `store`.
#[derive(Debug)]
pub struct CloneHeader {
    store: CloneBlockStore,
    ptes: usize,
    process_refs: ProcessRefs,
}

impl CloneHeader {
    /// Header for a store filled by one fork, referenced by the forking process.
    #[must_use]
    pub fn new(store: CloneBlockStore) -> Self {
        let ptes = store.len();
        Self {
            store,
            ptes,
            process_refs: ProcessRefs::new(1),
        }
    }

    #[must_use]
    pub const fn store(&self) -> &CloneBlockStore {
        &self.store
    }

    #[must_use]
    pub const fn number_of_ptes(&self) -> usize {
        self.ptes
    }

    #[must_use]
    pub const fn process_refs(&self) -> &ProcessRefs {
        &self.process_refs
    }
}

/// One process's view of a clone header's blocks.
#[derive(Debug)]
pub struct CloneDescriptor {
    start: PoolAddress,
    end: PoolAddress,
    refs: DescriptorRefs,
    ptes: usize,
    header: Arc<CloneHeader>,
    paged_pool_charge: usize,
}

impl CloneDescriptor {
    /// Descriptor covering every block of `header`, referenced by each of them once.
    #[must_use]
    pub fn new(header: Arc<CloneHeader>) -> Self {
        let start = header.store().base();
        let ptes = header.number_of_ptes();
        Self {
            start,
            end: start.add((ptes * CLONE_BLOCK_SIZE) as u64),
            refs: DescriptorRefs::new(ptes),
            ptes,
            paged_pool_charge: header.store().bytes(),
            header,
        }
    }

    /// Copy for a child; the caller has taken the header reference.
    #[must_use]
    pub fn replicate(&self) -> Self {
        Self {
            start: self.start,
            end: self.end,
            refs: self.refs.clamped_copy(),
            ptes: self.ptes,
            header: Arc::clone(&self.header),
            paged_pool_charge: self.paged_pool_charge,
        }
    }

    #[must_use]
    pub const fn start(&self) -> PoolAddress {
        self.start
    }

    /// First address past the descriptor's blocks.
    #[must_use]
    pub const fn end(&self) -> PoolAddress {
        self.end
    }

    #[must_use]
    pub const fn contains(&self, address: PoolAddress) -> bool {
        address.as_u64() >= self.start.as_u64() && address.as_u64() < self.end.as_u64()
    }

    #[must_use]
    pub const fn refs(&self) -> &DescriptorRefs {
        &self.refs
    }

    #[must_use]
    pub const fn number_of_ptes(&self) -> usize {
        self.ptes
    }

    #[must_use]
    pub const fn header(&self) -> &Arc<CloneHeader> {
        &self.header
    }

    /// Paged pool quota held for the store on behalf of this descriptor.
    #[must_use]
    pub const fn paged_pool_charge(&self) -> usize {
        self.paged_pool_charge
    }

    #[must_use]
    pub fn block(&self, address: PoolAddress) -> Option<&CloneBlock> {
        if !self.contains(address) {
            return None;
        }
        self.header.store().block_at(address)
    }
}

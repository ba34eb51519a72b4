use super::descriptor::CloneDescriptor;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;
use kernel_memory_addresses::PoolAddress;

/// Non-paged pool bytes of one registry root.
pub const CLONE_ROOT_SIZE: usize = size_of::<CloneDescriptorRegistry>();

/// A process's clone descriptors, keyed by the start of their block range.
///
/// Ranges never overlap: each descriptor names a distinct store.
#[derive(Debug, Default)]
pub struct CloneDescriptorRegistry {
    nodes: BTreeMap<PoolAddress, Arc<CloneDescriptor>>,
}

impl CloneDescriptorRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self { nodes: BTreeMap::new() }
    }

    pub fn insert(&mut self, descriptor: Arc<CloneDescriptor>) {
        let previous = self.nodes.insert(descriptor.start(), descriptor);
        debug_assert!(previous.is_none(), "clone descriptor inserted twice");
    }

    /// Removes `descriptor`; `false` if it was not registered.
    pub fn remove(&mut self, descriptor: &Arc<CloneDescriptor>) -> bool {
        if !self.contains(descriptor) {
            return false;
        }
        self.nodes.remove(&descriptor.start()).is_some()
    }

    /// The descriptor whose block range holds `address`.
    #[must_use]
    pub fn find_containing(&self, address: PoolAddress) -> Option<&Arc<CloneDescriptor>> {
        self.nodes
            .range(..=address)
            .next_back()
            .map(|(_, descriptor)| descriptor)
            .filter(|descriptor| descriptor.contains(address))
    }

    /// Whether this exact descriptor is registered.
    #[must_use]
    pub fn contains(&self, descriptor: &Arc<CloneDescriptor>) -> bool {
        self.nodes
            .get(&descriptor.start())
            .is_some_and(|registered| Arc::ptr_eq(registered, descriptor))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CloneDescriptor>> {
        self.nodes.values()
    }

    /// Owned references to every descriptor, in address order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<CloneDescriptor>> {
        self.nodes.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

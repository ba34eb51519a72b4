use kernel_alloc::{PoolError, QuotaError};
use kernel_memory_addresses::VirtualPageNumber;
use kernel_vmem::WalkError;

/// Reasons an address-space clone is refused.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ForkError {
    #[error("the address space is being deleted")]
    ProcessTerminating,
    #[error("insufficient system resources")]
    InsufficientResources,
    #[error("process quota exceeded")]
    InsufficientQuota,
    /// The address space holds a region fork cannot replicate.
    #[error("address space contains a region that cannot be cloned")]
    InvalidPageProtection,
}

impl From<PoolError> for ForkError {
    fn from(_: PoolError) -> Self {
        Self::InsufficientResources
    }
}

impl From<QuotaError> for ForkError {
    fn from(_: QuotaError) -> Self {
        Self::InsufficientQuota
    }
}

impl From<WalkError> for ForkError {
    fn from(_: WalkError) -> Self {
        Self::InsufficientResources
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error("no committed region maps the page")]
    NoVad,
    #[error("the page is not backed by a fork clone block")]
    NotClonePrototype,
    #[error("the address space is being deleted")]
    ProcessTerminating,
    #[error("out of physical pages")]
    OutOfResources,
}

impl From<WalkError> for FaultError {
    fn from(_: WalkError) -> Self {
        Self::OutOfResources
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VadError {
    #[error("range starting at {start} overlaps an existing region")]
    Overlap { start: VirtualPageNumber },
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("out of physical pages for page tables")]
    OutOfResources,
    #[error("the address space is being deleted")]
    ProcessTerminating,
}

impl From<WalkError> for VadError {
    fn from(_: WalkError) -> Self {
        Self::OutOfResources
    }
}

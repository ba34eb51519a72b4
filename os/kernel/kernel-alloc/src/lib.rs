//! # Kernel Memory Allocation
//!
//! The physical and pool-level allocators the memory manager builds on:
//!
//! ```text
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │      PFN database            │  │       Paged pool             │
//! │  • frame share/ref counts    │  │  • trimmable pool pages      │
//! │  • page-table page contents  │  │  • lock / share residency    │
//! │  • owning-PTE back-pointers  │  └──────────────────────────────┘
//! └──────────────────────────────┘  ┌──────────────────────────────┐
//! ┌──────────────────────────────┐  │     Non-paged pool           │
//! │      Paging file             │  │  • byte accounting           │
//! │  • slot allocation           │  └──────────────────────────────┘
//! └──────────────────────────────┘  ┌──────────────────────────────┐
//!                                   │     Process quota            │
//!                                   │  • paged / non-paged / commit│
//!                                   └──────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! [`PfnDatabase`] carries no lock of its own; the memory manager wraps it in
//! a [`kernel_sync::SpinLock`] (the PFN lock). The pools lock internally and
//! never call out while holding their lock, so they may be used under any
//! other lock. [`QuotaBlock`] is lock-free.
//!
//! ## Failure injection
//!
//! Every allocator that can fail accepts a [`FailurePlan`] so that callers can
//! exercise their out-of-resources paths deterministically.
//!
//! ```rust
//! use kernel_alloc::{FailurePlan, PfnDatabase};
//! use kernel_vmem::FrameAlloc;
//!
//! let mut pfn = PfnDatabase::new(8);
//! pfn.inject_failures(FailurePlan::transient(1));
//! assert!(pfn.allocate_page(0).is_none());
//! assert!(pfn.allocate_page(0).is_some());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod failure;
pub mod non_paged_pool;
pub mod paged_pool;
pub mod paging_file;
pub mod pfn;
pub mod quota;

pub use failure::{FailureInjector, FailurePlan};
pub use non_paged_pool::NonPagedPool;
pub use paged_pool::{PAGED_POOL_BASE, PagedPool, PoolPageState};
pub use paging_file::PagingFile;
pub use pfn::{PageLocation, PfnBacking, PfnDatabase, PfnEntry, PteAddress, PteFrame};
pub use quota::{QuotaBlock, QuotaError, QuotaKind};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted allocating {requested} bytes")]
    Exhausted { requested: usize },
}

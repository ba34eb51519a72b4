//! # Page Numbers and Pool Addresses
//!
//! Strongly typed wrappers for the handful of address kinds the memory
//! manager passes around.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualPageNumber`] | Index of a 4 KiB page in a process address space. |
//! | [`VirtualPageRange`] | An inclusive run of virtual pages, as described by a VAD. |
//! | [`PageFrameNumber`] | Index of a physical page frame in the PFN database. |
//! | [`PoolAddress`] | A byte address inside system pool (prototype PTEs, clone blocks). |
//! | [`PoolPage`] | The page-aligned base of a [`PoolAddress`]. |
//!
//! All types are `#[repr(transparent)]` over `u64` and implement `Copy`,
//! `Eq`, `Ord` and `Hash`, so they can be used as map keys directly.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let range = VirtualPageRange::new(VirtualPageNumber::new(10), VirtualPageNumber::new(12));
//! assert_eq!(range.len(), 3);
//!
//! let addr = PoolAddress::new(0x5000_0000_1010);
//! assert_eq!(addr.page().base(), PoolAddress::new(0x5000_0000_1000));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_frame;
mod pool_address;
mod virtual_page;

pub use page_frame::PageFrameNumber;
pub use pool_address::{PoolAddress, PoolPage};
pub use virtual_page::{VirtualPageNumber, VirtualPageRange, VirtualPageRangeIter};

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

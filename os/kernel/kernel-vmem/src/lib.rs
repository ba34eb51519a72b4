//! # Virtual Memory Support
//!
//! Paging structures as the memory manager sees them: a software PTE
//! format, 2/3/4-level hierarchies, and the walker fork uses to pair a
//! parent's PTEs with the child's.
//!
//! ## What you get
//! - [`PteBits`] / [`Pte`]: the raw entry word and its decoded state
//!   (zero, valid, transition, prototype, paging file).
//! - [`Protection`]: software protection codes, including write-copy and decommit.
//! - [`PagingMode`] and [`EntryLocation`]: index arithmetic per level.
//! - [`FrameAlloc`] / [`PageTableMemory`]: the collaborator interface to the
//!   PFN database, implemented elsewhere.
//! - [`hierarchy`]: lookups, construction and teardown of one hierarchy.
//! - [`PageTableWalker`]: the lazy source/destination slot walk.
//!
//! ## Levels
//!
//! ```text
//!  PXE (4) → PPE (3) → PDE (2) → PTE (1) → page
//! ```
//!
//! Two-level mode starts at the PDE, three-level mode at a 4-entry PPE table.
//! Every table is one page-table page owned by a PFN database entry.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::module_name_repetitions)]

pub mod hierarchy;
mod memory;
mod paging;
mod pte;
#[cfg(test)]
mod test_memory;
mod walker;

pub use kernel_memory_addresses as addresses;
pub use memory::{FrameAlloc, PageTableMemory};
pub use paging::{EntryLocation, LEAF_LEVEL, PagingMode};
pub use pte::{Protection, Pte, PteBits};
pub use walker::{PageTableWalker, PteSlot, WalkError};

//! # Process Fork
//!
//! Copy-on-write cloning of process address spaces, and the fault, trim
//! and teardown paths that keep the shared pages consistent afterwards.
//!
//! ## What you get
//! - [`MemoryManager`]: the PFN database, pools, paging file and TB model,
//!   with every address-space operation as a method.
//! - [`Process`] / [`Thread`]: the lock owners. See [`process`] for the
//!   lock order.
//! - [`Vad`] / [`VadTree`]: the regions of an address space.
//! - [`clone`]: clone blocks, descriptors and the per-process registry.
//!
//! ## Lifecycle of a shared page
//!
//! ```text
//!   private PTE ──fork──► Prototype PTE (parent and child) ──► clone block
//!                             │ read fault                    saved PTE
//!                             ▼
//!                         valid write-copy ──write fault──► private copy,
//!                                                           block ref - 1
//! ```
//!
//! When the last PTE naming a block goes away the block releases the page
//! it saved; when the last block of a store is gone the store's pool goes
//! with its header.
//!
//! ## Example
//!
//! ```rust
//! use kernel_alloc::QuotaBlock;
//! use kernel_fork::{MemoryManager, MmConfig, Thread, Vad};
//! use kernel_memory_addresses::{VirtualPageNumber, VirtualPageRange};
//! use kernel_vmem::{Protection, Pte};
//!
//! let mm = MemoryManager::new(MmConfig::default(), 256, 64);
//! let thread = Thread::new();
//! let parent = mm.create_process(QuotaBlock::unlimited()).unwrap();
//! let child = mm.create_process(QuotaBlock::unlimited()).unwrap();
//!
//! let page = VirtualPageNumber::new(0x1000);
//! let range = VirtualPageRange::with_len(page, 4);
//! mm.insert_vad(&thread, &parent, Vad::private(range, Protection::READWRITE)).unwrap();
//! mm.resolve_demand_zero_fault(&thread, &parent, page).unwrap();
//!
//! mm.clone_process_address_space(&thread, &parent, &child).unwrap();
//! assert!(matches!(mm.query_pte(&child, page), Pte::Prototype { .. }));
//! assert_eq!(mm.query_pte(&parent, page), mm.query_pte(&child, page));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::module_name_repetitions)]

extern crate alloc;

pub mod clone;
mod config;
mod deref;
mod error;
mod fault;
mod fork;
mod memory_manager;
pub mod process;
mod tb;
mod teardown;
mod thread;
mod vad;
mod working_set;

pub use config::{Backoff, MmConfig};
pub use error::{FaultError, ForkError, VadError};
pub use memory_manager::{MemoryManager, SECTION_PROTOTYPE_BASE};
pub use process::{ForkGate, Process, ProcessId, WorkingSet, WorkingSetGuard, WsLockMode};
pub use tb::{PendingFlushList, SoftTlb, TbStats};
pub use thread::{AttachGuard, Thread, ThreadId};
pub use vad::{ControlArea, Inherit, OwnedVad, SectionKind, VAD_SIZE, Vad, VadFlags, VadTree, VadType};

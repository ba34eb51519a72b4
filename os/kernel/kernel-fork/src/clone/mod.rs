//! # Fork Clone Structures
//!
//! A fork that shares private pages records them in a [`CloneBlockStore`]:
//! one [`CloneBlock`] per page, holding the PTE the page had and the number
//! of PTEs (across every process of the lineage) that name the block.
//!
//! ```text
//!   parent registry            child registry
//!   ┌──────────────┐           ┌──────────────┐
//!   │ descriptor P │           │ descriptor C │   live / pending counts
//!   └──────┬───────┘           └──────┬───────┘   per process
//!          └──────────┬───────────────┘
//!              ┌──────▼──────┐
//!              │ CloneHeader │   process references
//!              └──────┬──────┘
//!              ┌──────▼──────────────────────┐
//!              │ CloneBlockStore [b0 b1 ...] │   per-block references
//!              └─────────────────────────────┘
//! ```
//!
//! Each process indexes its descriptors in a [`CloneDescriptorRegistry`],
//! looked up by the pool address of a prototype PTE. The registry, the
//! descriptor counts and the header count are changed under the owning
//! process's working-set lock; block counts are atomic.

mod block;
mod descriptor;
mod refcount;
mod registry;

pub use block::{CLONE_BLOCK_SIZE, CloneBlock, CloneBlockStore};
pub use descriptor::{CLONE_DESCRIPTOR_SIZE, CLONE_HEADER_SIZE, CloneDescriptor, CloneHeader};
pub use refcount::{BlockRefCount, DescriptorRefs, ProcessRefs, RefEvent};
pub use registry::{CLONE_ROOT_SIZE, CloneDescriptorRegistry};

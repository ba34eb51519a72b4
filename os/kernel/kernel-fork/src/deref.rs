//! # Clone Reference Release
//!
//! Retiring a PTE that names a clone block drops three counts, innermost
//! first: the descriptor's live count, the block's count and the
//! descriptor's pending count. The header's process count follows when
//! the descriptor goes.
//!
//! Any step that has to release the PFN lock first flushes the caller's
//! pending TB entries; the caller learns from the return value that the
//! locks were dropped and must re-read whatever it looked at before.

use crate::clone::{CLONE_DESCRIPTOR_SIZE, CLONE_HEADER_SIZE, CloneDescriptor};
use crate::memory_manager::MemoryManager;
use crate::process::{Process, WorkingSetGuard};
use crate::tb::PendingFlushList;
use alloc::sync::Arc;
use kernel_alloc::{PfnDatabase, QuotaKind};
use kernel_memory_addresses::PoolAddress;
use kernel_sync::SpinLockGuard;
use kernel_vmem::{FrameAlloc, PageTableMemory, Pte, PteBits};
use log::{debug, trace};

impl MemoryManager {
    /// Drops one reference of the calling process on `descriptor` and, if
    /// given, on the clone block at `block`.
    ///
    /// The caller holds the working-set lock of the process owning
    /// `descriptor` and the PFN lock. Both are held again on return; the
    /// result tells whether they were released in between.
    ///
    /// # Panics
    /// If `block` is not a block of `descriptor`.
    pub fn decrement_clone_block_reference(
        &self,
        ws: &mut WorkingSetGuard<'_>,
        pfn: &mut SpinLockGuard<'_, PfnDatabase>,
        descriptor: &Arc<CloneDescriptor>,
        block: Option<PoolAddress>,
        pending: &mut PendingFlushList,
    ) -> bool {
        let mut released = false;

        if descriptor.refs().release_live().is_some() {
            trace!("last live reference on clone descriptor at {}", descriptor.start());
            pending.flush(&self.tb);
            released = true;
            pfn.unlocked(|| {
                if let Some(registry) = ws.clone_root.as_mut() {
                    registry.remove(descriptor);
                }
            });
        }

        loop {
            if let Some(address) = block
                && !self.paged_pool.is_resident(address)
            {
                trace!("faulting in clone block {address}");
                pending.flush(&self.tb);
                released = true;
                pfn.unlocked(|| ws.unlocked(|| self.paged_pool.make_resident(address)));
                continue;
            }
            if ws.process().fork_gate().is_active_for_other(ws.thread()) {
                pending.flush(&self.tb);
                released = true;
                pfn.unlocked(|| self.wait_for_fork_to_complete(ws));
                continue;
            }
            break;
        }

        if let Some(address) = block {
            let Some(clone) = descriptor.block(address) else {
                panic!("{address} is not a block of the clone descriptor at {}", descriptor.start());
            };
            if clone.refs().decrement() {
                self.retire_clone_block(pfn, address, clone.saved_pte());
            }
        }

        if descriptor.refs().release_pending().is_some() {
            pending.flush(&self.tb);
            released = true;
            let process = ws.process();
            pfn.unlocked(|| ws.unlocked(|| self.release_descriptor(process, descriptor)));
        }

        released
    }

    /// Waits for a fork of the process running on another thread.
    ///
    /// Returns `false` at once when no fork is running or the caller is the
    /// forking thread. Otherwise the working-set lock is released, the
    /// address-space lock (held by the fork until it completes) is passed
    /// through, and the working-set lock is taken again in its original mode.
    pub fn wait_for_fork_to_complete(&self, ws: &mut WorkingSetGuard<'_>) -> bool {
        let process = ws.process();
        if !process.fork_gate().is_active_for_other(ws.thread()) {
            return false;
        }
        trace!("{:?}: waiting for fork to complete", process.id());
        ws.unlocked(|| process.rendezvous_address_space());
        true
    }

    /// Releases what a clone block held once nothing references it.
    fn retire_clone_block(&self, pfn: &mut PfnDatabase, address: PoolAddress, saved: PteBits) {
        match saved.decode() {
            Pte::Valid { frame, .. } => {
                self.release_paging_file_space(pfn.mark_deleted(frame));
                self.paged_pool.decrement_share(address.page());
                pfn.decrement_share_count(frame);
            }
            Pte::Transition { frame, .. } => {
                self.release_paging_file_space(pfn.mark_deleted(frame));
                self.paged_pool.decrement_share(address.page());
                if pfn.entry(frame).reference_count == 0 {
                    pfn.free_page(frame);
                }
            }
            pte @ Pte::PageFile { offset, .. } if !pte.is_demand_zero() && !pte.is_decommitted() => {
                self.paging_file.lock().release(offset);
            }
            Pte::Zero | Pte::Prototype { .. } | Pte::PageFile { .. } => {}
        }
        trace!("clone block {address} retired");
    }

    /// Frees a descriptor whose last pending operation finished, and its
    /// header and store if no other process holds them.
    fn release_descriptor(&self, process: &Process, descriptor: &CloneDescriptor) {
        let header = descriptor.header();
        if header.process_refs().release() {
            let store = header.store();
            debug!("freeing clone header of {} blocks at {}", header.number_of_ptes(), store.base());
            self.paged_pool.free(store.base(), store.bytes());
            self.non_paged_pool.free(CLONE_HEADER_SIZE);
        }
        if !process.fork_failed() {
            process.quota().release(QuotaKind::PagedPool, descriptor.paged_pool_charge());
            process.quota().release(QuotaKind::NonPagedPool, CLONE_HEADER_SIZE);
        }
        self.non_paged_pool.free(CLONE_DESCRIPTOR_SIZE);
        debug!("{:?}: clone descriptor at {} freed", process.id(), descriptor.start());
    }
}

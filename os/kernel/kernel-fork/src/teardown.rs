//! Address-space deletion.

use crate::clone::CLONE_ROOT_SIZE;
use crate::memory_manager::MemoryManager;
use crate::process::{Process, WsLockMode};
use crate::tb::PendingFlushList;
use crate::thread::Thread;
use crate::vad::{VAD_SIZE, VadType};
use kernel_alloc::QuotaKind;
use kernel_vmem::hierarchy::{LeafLookup, find_leaf, free_hierarchy, large_page_frame};
use kernel_vmem::{EntryLocation, FrameAlloc, LEAF_LEVEL, PteBits};
use log::{debug, info};

impl MemoryManager {
    /// Deletes the address space of `process`: every page, clone reference,
    /// page table and region it holds is released and its charges returned.
    ///
    /// Faults and forks arriving afterwards fail with `ProcessTerminating`.
    /// Calling it again does nothing.
    pub fn delete_address_space(&self, thread: &Thread, process: &Process) {
        let _address_space = process.lock_address_space(thread);
        if process.is_vm_deleted() {
            return;
        }
        process.mark_vm_deleted();
        let mut ws = process.lock_working_set(thread, WsLockMode::Unsafe);
        let vads = ws.vads.take_all();
        let mode = self.config.paging_mode;
        let mut pending = PendingFlushList::new(process.id(), self.config.flush_list_capacity);

        let mut pfn = self.pfn.lock();
        for vad in &vads {
            if vad.kind == VadType::LargePageSection
                && let Some(frame) = large_page_frame(&*pfn, mode, process.root(), vad.range.start())
            {
                pfn.free_page(frame);
            }
            let mut vpn = vad.range.start();
            while vad.range.contains(vpn) {
                match find_leaf(&*pfn, mode, process.root(), vpn) {
                    LeafLookup::Absent { level } => vpn = vpn.align_up_next(mode.span(level)),
                    LeafLookup::Present(table) => {
                        let at = EntryLocation::of(mode, table, vpn, LEAF_LEVEL);
                        self.retire_pte(&mut ws, &mut pfn, at, vpn, PteBits::ZERO, &mut pending);
                        vpn = vpn.next();
                    }
                }
            }
        }
        pending.flush(&self.tb);
        let tables = free_hierarchy(&mut *pfn, mode, process.root());
        pfn.free_page(process.root());
        drop(pfn);

        for vad in vads {
            self.non_paged_pool.free(VAD_SIZE);
            if vad.commit_charge != usize::MAX {
                process.quota().release(QuotaKind::Commit, vad.commit_charge);
            }
            vad.release_view();
            process.shrink_virtual_size(usize::try_from(vad.range.len()).unwrap_or(usize::MAX));
        }

        if let Some(registry) = ws.clone_root.take() {
            debug_assert!(
                registry.is_empty(),
                "{:?} still holds {} clone descriptors",
                process.id(),
                registry.len()
            );
            self.non_paged_pool.free(CLONE_ROOT_SIZE);
        }
        self.tb.flush_entire(process.id());
        debug!("{:?}: freed {tables} page tables", process.id());
        info!("deleted address space of {:?}", process.id());
    }
}

//! Working-set operations that take pages away from a process: trimming,
//! paging out and decommitting. [`MemoryManager::retire_pte`] is shared
//! with address-space deletion.

use crate::error::FaultError;
use crate::memory_manager::MemoryManager;
use crate::process::{Process, WorkingSetGuard};
use crate::tb::PendingFlushList;
use crate::thread::Thread;
use kernel_alloc::{PfnDatabase, PteAddress};
use kernel_memory_addresses::VirtualPageNumber;
use kernel_sync::SpinLockGuard;
use kernel_vmem::hierarchy::{ensure_pte, pte_location};
use kernel_vmem::{EntryLocation, FrameAlloc, PageTableMemory, Protection, Pte, PteBits};
use log::trace;

impl MemoryManager {
    /// Trims a valid page: a private page goes to transition, a clone page
    /// back to its Prototype PTE.
    ///
    /// # Errors
    /// [`FaultError::ProcessTerminating`] once the address space is being deleted.
    pub fn trim_page(&self, thread: &Thread, process: &Process, vpn: VirtualPageNumber) -> Result<(), FaultError> {
        let _ws = self.lock_for_fault(thread, process)?;
        let mut pfn = self.pfn.lock();
        let Some(at) = pte_location(&*pfn, self.config.paging_mode, process.root(), vpn) else {
            return Ok(());
        };
        let Pte::Valid { frame, protection, .. } = pfn.read(at).decode() else {
            return Ok(());
        };
        let backing = pfn.entry(frame).backing;
        match backing.pte_address {
            Some(PteAddress::Prototype(proto)) if backing.prototype => {
                pfn.write(at, PteBits::prototype_at(proto));
            }
            _ => pfn.write(at, PteBits::transition_frame(frame, protection)),
        }
        pfn.decrement_share_count(frame);
        self.tb.flush_single(process.id(), vpn);
        trace!("{:?}: trimmed {vpn}", process.id());
        Ok(())
    }

    /// Writes a private transition page to the paging file and frees its frame.
    ///
    /// # Errors
    /// [`FaultError::OutOfResources`] when the paging file is full.
    pub fn write_page_to_paging_file(
        &self,
        thread: &Thread,
        process: &Process,
        vpn: VirtualPageNumber,
    ) -> Result<(), FaultError> {
        let _ws = self.lock_for_fault(thread, process)?;
        let mut pfn = self.pfn.lock();
        let Some(at) = pte_location(&*pfn, self.config.paging_mode, process.root(), vpn) else {
            return Ok(());
        };
        let Pte::Transition { frame, protection } = pfn.read(at).decode() else {
            return Ok(());
        };
        if pfn.entry(frame).reference_count != 0 {
            return Ok(());
        }
        let offset = self.paging_file.lock().allocate().ok_or(FaultError::OutOfResources)?;
        pfn.write(at, PteBits::paging_file(offset, protection));
        pfn.free_page(frame);
        trace!("{:?}: {vpn} paged out to slot {offset}", process.id());
        Ok(())
    }

    /// Decommits one page of a private region, releasing whatever backed it.
    ///
    /// # Errors
    /// [`FaultError::NoVad`] outside private memory.
    pub fn decommit_page(&self, thread: &Thread, process: &Process, vpn: VirtualPageNumber) -> Result<(), FaultError> {
        let mut ws = self.lock_for_fault(thread, process)?;
        if !ws.vads.find(vpn).is_some_and(|vad| vad.is_private()) {
            return Err(FaultError::NoVad);
        }
        let mut pfn = self.pfn.lock();
        let at = ensure_pte(
            &mut *pfn,
            self.config.paging_mode,
            process.root(),
            vpn,
            self.config.color_of(vpn),
        )?;
        let mut pending = PendingFlushList::new(process.id(), self.config.flush_list_capacity);
        let decommitted = PteBits::paging_file(0, Protection::DECOMMIT);
        self.retire_pte(&mut ws, &mut pfn, at, vpn, decommitted, &mut pending);
        pending.flush(&self.tb);
        Ok(())
    }

    /// Replaces the PTE at `at` with `replacement` and releases what the old
    /// one held: its frame or paging-file slot for a private page, its clone
    /// block reference for a clone PTE.
    ///
    /// Retired translations are added to `pending`. The locks may be
    /// released on the way, see [`MemoryManager::decrement_clone_block_reference`].
    pub(crate) fn retire_pte(
        &self,
        ws: &mut WorkingSetGuard<'_>,
        pfn: &mut SpinLockGuard<'_, PfnDatabase>,
        at: EntryLocation,
        vpn: VirtualPageNumber,
        replacement: PteBits,
        pending: &mut PendingFlushList,
    ) {
        let process = ws.process();
        let old = pfn.read(at);
        match (old.is_zero(), replacement.is_zero()) {
            (true, false) => pfn.increment_used_entries(at.table),
            (false, true) => pfn.decrement_used_entries(at.table),
            _ => {}
        }
        pfn.write(at, replacement);

        let clone_block = match old.decode() {
            Pte::Zero => None,
            Pte::Valid { frame, .. } => {
                pending.add(vpn);
                let backing = pfn.entry(frame).backing;
                if let Some(PteAddress::Prototype(proto)) = backing.pte_address
                    && backing.prototype
                {
                    pfn.decrement_share_count(frame);
                    Some(proto)
                } else {
                    process.remove_private_pages(1);
                    self.release_paging_file_space(pfn.mark_deleted(frame));
                    pfn.decrement_share_count(frame);
                    None
                }
            }
            Pte::Transition { frame, .. } => {
                process.remove_private_pages(1);
                self.release_paging_file_space(pfn.mark_deleted(frame));
                if pfn.entry(frame).reference_count == 0 {
                    pfn.free_page(frame);
                }
                None
            }
            Pte::Prototype { proto } => Some(proto),
            pte @ Pte::PageFile { offset, .. } => {
                if !pte.is_demand_zero() && !pte.is_decommitted() {
                    self.paging_file.lock().release(offset);
                    process.remove_private_pages(1);
                }
                None
            }
        };

        if let Some(proto) = clone_block
            && let Some(descriptor) = ws.clone_descriptor(proto)
        {
            self.decrement_clone_block_reference(ws, pfn, &descriptor, Some(proto), pending);
        }
    }
}

//! Page fault resolution for private and fork-shared pages.
//!
//! Every fault takes the working-set lock, waits for a fork running on
//! another thread of the process, and only then looks at the PTE.

use crate::error::FaultError;
use crate::memory_manager::MemoryManager;
use crate::process::{Process, WorkingSetGuard, WsLockMode};
use crate::tb::PendingFlushList;
use crate::thread::Thread;
use kernel_alloc::{PfnBacking, PteAddress, PteFrame};
use kernel_memory_addresses::VirtualPageNumber;
use kernel_vmem::hierarchy::{ensure_pte, pte_location};
use kernel_vmem::{FrameAlloc, PageTableMemory, Pte, PteBits};
use log::trace;

impl MemoryManager {
    /// Takes the working-set lock of `process` for a fault, once no fork is
    /// running on another thread.
    pub(crate) fn lock_for_fault<'a>(&self, thread: &'a Thread, process: &'a Process) -> Result<WorkingSetGuard<'a>, FaultError> {
        let mut ws = process.lock_working_set(thread, WsLockMode::Safe);
        while self.wait_for_fork_to_complete(&mut ws) {}
        if process.is_vm_deleted() {
            return Err(FaultError::ProcessTerminating);
        }
        Ok(ws)
    }

    /// Gives a private region's untouched page a zeroed frame.
    ///
    /// # Errors
    /// [`FaultError::NoVad`] outside committed private memory,
    /// [`FaultError::OutOfResources`] without a free frame.
    pub fn resolve_demand_zero_fault(
        &self,
        thread: &Thread,
        process: &Process,
        vpn: VirtualPageNumber,
    ) -> Result<(), FaultError> {
        let ws = self.lock_for_fault(thread, process)?;
        let protection = match ws.vads.find(vpn) {
            Some(vad) if vad.is_private() => vad.protection,
            _ => return Err(FaultError::NoVad),
        };

        let color = self.config.color_of(vpn);
        let mut pfn = self.pfn.lock();
        let at = ensure_pte(&mut *pfn, self.config.paging_mode, process.root(), vpn, color)?;
        let current = pfn.read(at);
        match current.decode() {
            Pte::Zero => pfn.increment_used_entries(at.table),
            pte if pte.is_decommitted() => return Err(FaultError::NoVad),
            pte if pte.is_demand_zero() => {}
            _ => return Ok(()),
        }

        let Some(frame) = pfn.allocate_page(color) else {
            if current.is_zero() {
                pfn.decrement_used_entries(at.table);
            }
            return Err(FaultError::OutOfResources);
        };
        pfn.entry_mut(frame).backing = PfnBacking {
            pte_address: Some(PteAddress::Table(at)),
            prototype: false,
            pte_frame: Some(PteFrame::Table(at.table)),
            original_pte: PteBits::paging_file(0, protection),
        };
        pfn.increment_share_count(frame);
        pfn.write(at, PteBits::valid_frame(frame, protection));
        process.add_private_pages(1);
        trace!("{:?}: demand-zero {vpn} -> {frame}", process.id());
        Ok(())
    }

    /// Maps the page behind a clone Prototype PTE read-only, bringing the
    /// block's page back from transition or the paging file if needed.
    ///
    /// # Errors
    /// [`FaultError::NotClonePrototype`] when the PTE is not a clone PTE of
    /// the process, [`FaultError::OutOfResources`] without a free frame.
    pub fn resolve_clone_read_fault(
        &self,
        thread: &Thread,
        process: &Process,
        vpn: VirtualPageNumber,
    ) -> Result<(), FaultError> {
        let mut ws = self.lock_for_fault(thread, process)?;
        self.clone_read_locked(&mut ws, vpn)
    }

    fn clone_read_locked(&self, ws: &mut WorkingSetGuard<'_>, vpn: VirtualPageNumber) -> Result<(), FaultError> {
        let process = ws.process();
        loop {
            if ws.vads.find(vpn).is_none() {
                return Err(FaultError::NoVad);
            }
            let mut pfn = self.pfn.lock();
            let Some(at) = pte_location(&*pfn, self.config.paging_mode, process.root(), vpn) else {
                return Err(FaultError::NotClonePrototype);
            };
            let proto = match pfn.read(at).decode() {
                Pte::Valid { .. } => return Ok(()),
                Pte::Prototype { proto } => proto,
                _ => return Err(FaultError::NotClonePrototype),
            };
            let Some(descriptor) = ws.clone_descriptor(proto) else {
                return Err(FaultError::NotClonePrototype);
            };
            if !self.paged_pool.is_resident(proto) {
                drop(pfn);
                ws.unlocked(|| self.paged_pool.make_resident(proto));
                while self.wait_for_fork_to_complete(ws) {}
                if process.is_vm_deleted() {
                    return Err(FaultError::ProcessTerminating);
                }
                continue;
            }
            let Some(block) = descriptor.block(proto) else {
                panic!("{proto} is inside a clone descriptor but not a clone block");
            };

            let saved = block.saved_pte();
            let frame = match saved.decode() {
                Pte::Valid { frame, .. } => frame,
                Pte::Transition { frame, protection } => {
                    pfn.increment_share_count(frame);
                    block.set_saved_pte(PteBits::valid_frame(frame, protection).make_write_copy());
                    frame
                }
                Pte::PageFile { protection, .. } => {
                    let frame = pfn
                        .allocate_page(self.config.color_of(vpn))
                        .ok_or(FaultError::OutOfResources)?;
                    pfn.entry_mut(frame).backing = PfnBacking {
                        pte_address: Some(PteAddress::Prototype(proto)),
                        prototype: true,
                        pte_frame: Some(PteFrame::Pool(proto.page())),
                        original_pte: saved,
                    };
                    self.paged_pool.increment_share(proto.page());
                    pfn.increment_share_count(frame);
                    block.set_saved_pte(PteBits::valid_frame(frame, protection).make_write_copy());
                    frame
                }
                Pte::Zero | Pte::Prototype { .. } => {
                    panic!("clone block {proto} saves {saved:?}, which cannot back a page");
                }
            };

            pfn.increment_share_count(frame);
            let protection = block.saved_pte().protection();
            pfn.write(at, PteBits::valid_frame(frame, protection).make_write_copy());
            trace!("{:?}: {vpn} maps clone block {proto} frame {frame}", process.id());
            return Ok(());
        }
    }

    /// Gives the process its own copy of a page shared through a clone
    /// block and drops its reference on the block. A page the process
    /// already owns privately is left alone.
    ///
    /// # Errors
    /// [`FaultError::NotClonePrototype`] for a page that is not backed by a
    /// clone block of the process, [`FaultError::OutOfResources`] without a
    /// free frame.
    pub fn copy_on_write_fault(&self, thread: &Thread, process: &Process, vpn: VirtualPageNumber) -> Result<(), FaultError> {
        let mut ws = self.lock_for_fault(thread, process)?;
        self.clone_read_locked(&mut ws, vpn)?;

        let mut pfn = self.pfn.lock();
        let Some(at) = pte_location(&*pfn, self.config.paging_mode, process.root(), vpn) else {
            return Err(FaultError::NotClonePrototype);
        };
        let pte = pfn.read(at);
        let Pte::Valid { frame, protection, .. } = pte.decode() else {
            return Err(FaultError::NotClonePrototype);
        };
        let backing = pfn.entry(frame).backing;
        let proto = match backing.pte_address {
            Some(PteAddress::Prototype(proto)) if backing.prototype => proto,
            Some(PteAddress::Table(_)) => return Ok(()),
            _ => return Err(FaultError::NotClonePrototype),
        };
        let Some(descriptor) = ws.clone_descriptor(proto) else {
            return Err(FaultError::NotClonePrototype);
        };

        let writable = protection.to_read_write();
        let Some(copy) = pfn.allocate_page(self.config.color_of(vpn)) else {
            return Err(FaultError::OutOfResources);
        };
        pfn.entry_mut(copy).backing = PfnBacking {
            pte_address: Some(PteAddress::Table(at)),
            prototype: false,
            pte_frame: Some(PteFrame::Table(at.table)),
            original_pte: PteBits::paging_file(0, writable),
        };
        pfn.increment_share_count(copy);
        pfn.write(at, PteBits::valid_frame(copy, writable));
        pfn.decrement_share_count(frame);
        process.add_private_pages(1);
        trace!("{:?}: {vpn} copied from {frame} to {copy}", process.id());

        let mut pending = PendingFlushList::new(process.id(), self.config.flush_list_capacity);
        pending.add(vpn);
        self.decrement_clone_block_reference(&mut ws, &mut pfn, &descriptor, Some(proto), &mut pending);
        pending.flush(&self.tb);
        Ok(())
    }
}

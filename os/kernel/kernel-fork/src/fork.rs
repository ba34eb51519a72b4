//! # Address-Space Cloning
//!
//! [`MemoryManager::clone_process_address_space`] copies the parent's
//! inheritable regions into a fresh child. Private pages are not copied:
//! each one moves into a clone block of a new [`CloneBlockStore`] and both
//! processes get a Prototype PTE naming that block, so the first write on
//! either side takes a private copy.
//!
//! ## Phases
//!
//! ```text
//!  attach ─► lock AS ─► charge store ◄─┐ private pages grew
//!                         │ ───────────┘
//!                         ▼
//!               reject unclonable VADs ─► mark fork in progress
//!                         ▼
//!        registries, header, descriptor ─► duplicate VADs
//!                         ▼
//!               walk every inherited VAD  ──► roll back on failure
//!                         ▼
//!        attach descriptor ─► flush TB ─► replicate descriptors
//!                         ▼
//!        insert into child ─► charge child ─► unlock, detach
//! ```
//!
//! Every resource taken before the walk is held by a guard that gives it
//! back when dropped, so an early return releases exactly what was taken.

use crate::clone::{
    CLONE_BLOCK_SIZE, CLONE_DESCRIPTOR_SIZE, CLONE_HEADER_SIZE, CLONE_ROOT_SIZE, CloneBlockStore, CloneDescriptor,
    CloneDescriptorRegistry, CloneHeader,
};
use crate::error::ForkError;
use crate::memory_manager::MemoryManager;
use crate::process::{Process, WorkingSetGuard, WsLockMode};
use crate::thread::Thread;
use crate::vad::{OwnedVad, VadType};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_alloc::{NonPagedPool, PagedPool, PfnBacking, PfnDatabase, PoolError, PteAddress, PteFrame, QuotaBlock, QuotaError, QuotaKind};
use kernel_memory_addresses::{PageFrameNumber, PoolAddress, PoolPage, VirtualPageRange};
use kernel_vmem::hierarchy::{free_hierarchy, maps_large_page};
use kernel_vmem::{EntryLocation, PageTableMemory, PageTableWalker, Pte, PteBits, PteSlot};
use log::{debug, info, trace, warn};

/// Quota charged on behalf of a fork, returned on drop unless kept.
struct QuotaCharge<'a> {
    quota: &'a QuotaBlock,
    kind: QuotaKind,
    amount: usize,
    armed: bool,
}

impl<'a> QuotaCharge<'a> {
    fn charge(quota: &'a QuotaBlock, kind: QuotaKind, amount: usize) -> Result<Self, QuotaError> {
        quota.charge(kind, amount)?;
        Ok(Self {
            quota,
            kind,
            amount,
            armed: true,
        })
    }

    const fn keep(&mut self) {
        self.armed = false;
    }
}

impl Drop for QuotaCharge<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.quota.release(self.kind, self.amount);
        }
    }
}

/// Non-paged pool taken on behalf of a fork.
struct NonPagedReservation<'a> {
    pool: &'a NonPagedPool,
    bytes: usize,
    armed: bool,
}

impl<'a> NonPagedReservation<'a> {
    fn allocate(pool: &'a NonPagedPool, bytes: usize) -> Result<Self, PoolError> {
        pool.allocate(bytes)?;
        Ok(Self {
            pool,
            bytes,
            armed: true,
        })
    }

    const fn keep(&mut self) {
        self.armed = false;
    }
}

impl Drop for NonPagedReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.free(self.bytes);
        }
    }
}

/// The paged-pool allocation of a clone block store, locked resident for
/// the fork. Dropping it unlocks the pages and, unless a header took the
/// allocation over, frees them.
struct StoreReservation<'a> {
    pool: &'a PagedPool,
    base: PoolAddress,
    capacity: usize,
    owned: bool,
}

impl<'a> StoreReservation<'a> {
    fn allocate(pool: &'a PagedPool, capacity: usize) -> Result<Self, PoolError> {
        let base = pool.allocate(capacity * CLONE_BLOCK_SIZE)?;
        pool.lock_range(base, capacity * CLONE_BLOCK_SIZE);
        Ok(Self {
            pool,
            base,
            capacity,
            owned: true,
        })
    }

    const fn bytes(&self) -> usize {
        self.capacity * CLONE_BLOCK_SIZE
    }

    const fn hand_over(&mut self) {
        self.owned = false;
    }
}

impl Drop for StoreReservation<'_> {
    fn drop(&mut self) {
        self.pool.unlock_range(self.base, self.bytes());
        if self.owned {
            self.pool.free(self.base, self.bytes());
        }
    }
}

/// Keeps one ancestor clone-block page resident while the walk increments
/// block counts on it.
struct ClonePin<'a> {
    pool: &'a PagedPool,
    page: Option<PoolPage>,
}

impl ClonePin<'_> {
    fn move_to(&mut self, page: PoolPage) {
        if let Some(previous) = self.page.replace(page) {
            self.pool.unlock_page(previous);
        }
        self.pool.lock_page(page);
    }
}

impl Drop for ClonePin<'_> {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.pool.unlock_page(page);
        }
    }
}

/// Undo record of one walk step.
enum JournalEntry {
    /// A parent PTE was turned into a clone PTE.
    Converted {
        at: EntryLocation,
        original: PteBits,
        block_page: PoolPage,
        frame: Option<(PageFrameNumber, PfnBacking)>,
    },
    /// The child took a reference on an existing clone block.
    Shared {
        descriptor: Arc<CloneDescriptor>,
        block: PoolAddress,
    },
}

enum CloneStep {
    Done,
    /// The slot names a clone block on a page that is not pinned yet.
    Pin(PoolPage),
}

/// State of the page-table walk of one fork.
struct CloneWalk<'a> {
    mm: &'a MemoryManager,
    parent: &'a Process,
    child: &'a Process,
    store: CloneBlockStore,
    pin: ClonePin<'a>,
    journal: Vec<JournalEntry>,
    fork_ptes: usize,
}

impl CloneWalk<'_> {
    fn clone_range(&mut self, ws: &mut WorkingSetGuard<'_>, range: VirtualPageRange) -> Result<(), ForkError> {
        let mm = self.mm;
        let mut pfn = mm.pfn.lock();
        let mut walker = PageTableWalker::new(
            mm.config.paging_mode,
            self.parent.root(),
            self.child.root(),
            range,
            mm.config.color_of(range.start()),
        );
        loop {
            let slot = match walker.next_slot(&mut *pfn) {
                Ok(Some(slot)) => slot,
                Ok(None) => return Ok(()),
                Err(error) => {
                    walker.finish(&mut *pfn);
                    return Err(error.into());
                }
            };
            loop {
                let step = self.clone_pte(ws.clone_root.as_ref(), &mut pfn, slot);
                match step {
                    Ok(CloneStep::Done) => break,
                    Ok(CloneStep::Pin(page)) => {
                        trace!("pinning clone page {page:?} for {}", slot.vpn);
                        let pin = &mut self.pin;
                        pfn.unlocked(|| ws.unlocked(|| pin.move_to(page)));
                    }
                    Err(error) => {
                        walker.finish(&mut *pfn);
                        return Err(error);
                    }
                }
            }
        }
    }

    fn clone_pte(
        &mut self,
        registry: Option<&CloneDescriptorRegistry>,
        pfn: &mut PfnDatabase,
        slot: PteSlot,
    ) -> Result<CloneStep, ForkError> {
        let source = pfn.read(slot.source);
        match source.decode() {
            Pte::Zero => Ok(CloneStep::Done),
            Pte::Valid { frame, .. } if pfn.entry(frame).backing.prototype => {
                let Some(PteAddress::Prototype(proto)) = pfn.entry(frame).backing.pte_address else {
                    panic!("frame {frame} is prototype-backed without a prototype PTE");
                };
                Ok(self.share_prototype(registry, pfn, slot, proto))
            }
            Pte::Prototype { proto } => Ok(self.share_prototype(registry, pfn, slot, proto)),
            pte @ Pte::PageFile { .. } if pte.is_demand_zero() || pte.is_decommitted() => {
                trace!("{}: copying {pte:?}", slot.vpn);
                Self::write_child(pfn, slot, source);
                Ok(CloneStep::Done)
            }
            Pte::Valid { .. } | Pte::Transition { .. } | Pte::PageFile { .. } => {
                self.convert_private(pfn, slot, source)?;
                Ok(CloneStep::Done)
            }
        }
    }

    /// Copies a Prototype PTE to the child, referencing the block if it is
    /// one of the parent's clone blocks.
    fn share_prototype(
        &mut self,
        registry: Option<&CloneDescriptorRegistry>,
        pfn: &mut PfnDatabase,
        slot: PteSlot,
        proto: PoolAddress,
    ) -> CloneStep {
        if let Some(descriptor) = registry.and_then(|registry| registry.find_containing(proto)) {
            if self.pin.page != Some(proto.page()) {
                return CloneStep::Pin(proto.page());
            }
            if !self.mm.paged_pool.is_resident(proto) {
                panic!("pinned clone block {proto} is not resident");
            }
            let Some(block) = descriptor.block(proto) else {
                panic!("{proto} is inside a clone descriptor but not a clone block");
            };
            block.refs().increment();
            trace!("{}: sharing clone block {proto}", slot.vpn);
            self.journal.push(JournalEntry::Shared {
                descriptor: Arc::clone(descriptor),
                block: proto,
            });
        }
        Self::write_child(pfn, slot, PteBits::prototype_at(proto));
        CloneStep::Done
    }

    /// Moves a private page into a new clone block shared by parent and child.
    fn convert_private(&mut self, pfn: &mut PfnDatabase, slot: PteSlot, source: PteBits) -> Result<(), ForkError> {
        let Some(block) = self.store.append(source.make_write_copy()) else {
            debug!("clone store exhausted at {}", slot.vpn);
            return Err(ForkError::InsufficientResources);
        };
        let frame = match source.decode() {
            Pte::Valid { frame, .. } | Pte::Transition { frame, .. } => {
                let entry = pfn.entry_mut(frame);
                let previous = entry.backing;
                entry.backing = PfnBacking {
                    pte_address: Some(PteAddress::Prototype(block)),
                    prototype: true,
                    pte_frame: Some(PteFrame::Pool(block.page())),
                    original_pte: previous
                        .original_pte
                        .with_protection(previous.original_pte.protection().to_write_copy()),
                };
                self.mm.paged_pool.increment_share(block.page());
                Some((frame, previous))
            }
            _ => None,
        };

        let clone_pte = PteBits::prototype_at(block);
        pfn.write(slot.source, clone_pte);
        Self::write_child(pfn, slot, clone_pte);
        self.parent.remove_private_pages(1);
        self.fork_ptes += 1;
        trace!("{}: {:?} moved to clone block {block}", slot.vpn, source.decode());
        self.journal.push(JournalEntry::Converted {
            at: slot.source,
            original: source,
            block_page: block.page(),
            frame,
        });
        Ok(())
    }

    fn write_child(pfn: &mut PfnDatabase, slot: PteSlot, pte: PteBits) {
        if pfn.read(slot.destination).is_zero() {
            pfn.increment_used_entries(slot.destination.table);
        }
        pfn.write(slot.destination, pte);
    }

    /// Restores every parent PTE the walk changed and frees the child's page
    /// tables.
    ///
    /// Transition directory entries of the parent that the walk made valid
    /// stay valid. They hold a share count on their page table like any
    /// valid entry and teardown treats them as such.
    fn roll_back(&mut self) {
        let mm = self.mm;
        let mut pfn = mm.pfn.lock();
        for entry in self.journal.drain(..).rev() {
            match entry {
                JournalEntry::Converted {
                    at,
                    original,
                    block_page,
                    frame,
                } => {
                    pfn.write(at, original);
                    if let Some((frame, backing)) = frame {
                        pfn.entry_mut(frame).backing = backing;
                        mm.paged_pool.decrement_share(block_page);
                    }
                    self.parent.add_private_pages(1);
                }
                JournalEntry::Shared { descriptor, block } => {
                    if let Some(block) = descriptor.block(block) {
                        block.refs().decrement();
                    }
                }
            }
        }
        let freed = free_hierarchy(&mut *pfn, mm.config.paging_mode, self.child.root());
        debug!("fork of {:?} rolled back, {freed} child tables freed", self.parent.id());
        self.fork_ptes = 0;
    }
}

impl MemoryManager {
    /// Clones the address space of `parent` into the empty `child`.
    ///
    /// On success the child holds a copy of every inheritable region; private
    /// pages of both processes are shared copy-on-write through clone blocks.
    ///
    /// # Errors
    /// - [`ForkError::ProcessTerminating`] if the parent's address space is being deleted.
    /// - [`ForkError::InvalidPageProtection`] if the parent maps a region that cannot be cloned.
    /// - [`ForkError::InsufficientQuota`] / [`ForkError::InsufficientResources`] when a charge
    ///   or allocation fails. Failures up to and including the walk leave the
    ///   parent as it was and the child untouched; a commit charge failure while
    ///   populating the child is returned with the child flagged
    ///   [`Process::fork_failed`].
    ///
    /// # Panics
    /// If the inherited regions overlap in the child, which means the parent's
    /// VAD tree is corrupt.
    pub fn clone_process_address_space(&self, thread: &Thread, parent: &Process, child: &Process) -> Result<(), ForkError> {
        let attach = (thread.attached_process() != Some(parent.id())).then(|| thread.attach(parent.id()));
        let address_space = parent.lock_address_space(thread);
        if parent.is_vm_deleted() {
            debug!("fork of {:?} refused: address space is being deleted", parent.id());
            return Err(ForkError::ProcessTerminating);
        }

        let (mut store_quota, mut header_quota, mut reservation, mut ws) = self.charge_clone_store(thread, parent)?;

        {
            let pfn = self.pfn.lock();
            let mode = self.config.paging_mode;
            for vad in ws.vads.iter() {
                let large_image = vad.kind == VadType::Image && maps_large_page(&*pfn, mode, parent.root(), vad.range.start());
                if vad.kind.rejects_fork() || large_image {
                    debug!("fork of {:?} refused: {:?} region at {}", parent.id(), vad.kind, vad.range.start());
                    return Err(ForkError::InvalidPageProtection);
                }
            }
        }
        let gate = parent.fork_gate().begin(thread);

        let mut child_root = NonPagedReservation::allocate(&self.non_paged_pool, CLONE_ROOT_SIZE)?;
        if ws.clone_root.is_none() {
            self.non_paged_pool.allocate(CLONE_ROOT_SIZE)?;
            ws.clone_root = Some(CloneDescriptorRegistry::new());
        }
        let mut header_pool = NonPagedReservation::allocate(&self.non_paged_pool, CLONE_HEADER_SIZE)?;
        let mut descriptor_pool = NonPagedReservation::allocate(&self.non_paged_pool, CLONE_DESCRIPTOR_SIZE)?;

        let mut new_vads = Vec::new();
        for vad in ws.vads.iter().filter(|vad| vad.is_inherited()) {
            let copy = OwnedVad::duplicate(vad, &self.non_paged_pool).map_err(|_| ForkError::InsufficientResources)?;
            new_vads.push(copy);
        }

        let mut walk = CloneWalk {
            mm: self,
            parent,
            child,
            store: CloneBlockStore::new(reservation.base, reservation.capacity),
            pin: ClonePin {
                pool: &self.paged_pool,
                page: None,
            },
            journal: Vec::new(),
            fork_ptes: 0,
        };
        for vad in &new_vads {
            if let Err(error) = walk.clone_range(&mut ws, vad.get().range) {
                walk.roll_back();
                return Err(error);
            }
        }
        let CloneWalk {
            store, pin, fork_ptes, ..
        } = walk;
        drop(pin);

        if fork_ptes == 0 {
            debug!("fork of {:?} shares no private pages, dropping the clone store", parent.id());
            drop(store);
        } else {
            reservation.hand_over();
            store_quota.keep();
            header_quota.keep();
            header_pool.keep();
            descriptor_pool.keep();
            let descriptor = Arc::new(CloneDescriptor::new(Arc::new(CloneHeader::new(store))));
            ws.clone_root.get_or_insert_with(CloneDescriptorRegistry::new).insert(descriptor);
        }
        drop((descriptor_pool, header_pool, header_quota, store_quota));

        self.tb.flush_entire(parent.id());
        let copies = self.copy_all_descriptors(&mut ws);

        let child_attach = thread.attach(child.id());
        let mut child_ws = child.lock_working_set(thread, WsLockMode::Unsafe);
        let mut status = Ok(());
        let mut virtual_pages = 0;
        for owned in new_vads {
            let mut vad = owned.into_vad();
            if status.is_ok()
                && let Err(error) = child.quota().charge(QuotaKind::Commit, vad.commit_charge)
            {
                warn!("commit charge for {:?} failed: {error}", child.id());
                child.mark_fork_failed();
                status = Err(ForkError::from(error));
            }
            if status.is_err() {
                vad.commit_charge = usize::MAX;
            }
            virtual_pages += usize::try_from(vad.range.len()).unwrap_or(usize::MAX);
            if let Err(error) = child_ws.vads.insert(vad) {
                panic!("inherited regions of {:?} overlap in {:?}: {error}", parent.id(), child.id());
            }
        }

        let paged_charge: usize = copies.iter().map(|copy| copy.paged_pool_charge()).sum();
        let non_paged_charge = copies.len() * CLONE_HEADER_SIZE;
        let replicated = copies.len();
        let registry = child_ws.clone_root.insert(CloneDescriptorRegistry::new());
        child_root.keep();
        for copy in copies {
            registry.insert(copy);
        }
        child.set_private_pages(parent.private_pages());
        child.grow_virtual_size(virtual_pages);

        if !child.fork_failed() {
            Self::charge_descriptors(child, paged_charge, non_paged_charge);
        }

        drop(child_ws);
        drop(child_attach);
        drop(gate);
        drop(ws);
        drop(reservation);
        drop(address_space);
        drop(attach);

        info!(
            "forked {:?} into {:?}: {fork_ptes} fork PTEs, {replicated} descriptors",
            parent.id(),
            child.id()
        );
        status
    }

    /// Charges the clone store of the next fork against the parent's quota
    /// and allocates it, retrying until the parent's private page count no
    /// longer outgrows the charge.
    #[allow(clippy::type_complexity)]
    fn charge_clone_store<'a>(
        &'a self,
        thread: &'a Thread,
        parent: &'a Process,
    ) -> Result<
        (
            QuotaCharge<'a>,
            QuotaCharge<'a>,
            StoreReservation<'a>,
            WorkingSetGuard<'a>,
        ),
        ForkError,
    > {
        let mut attempt = 0u32;
        loop {
            let count = parent.private_pages().max(1);
            let store_quota = QuotaCharge::charge(parent.quota(), QuotaKind::PagedPool, count * CLONE_BLOCK_SIZE)?;
            let header_quota = QuotaCharge::charge(parent.quota(), QuotaKind::NonPagedPool, CLONE_HEADER_SIZE)?;
            let reservation = StoreReservation::allocate(&self.paged_pool, count)?;
            let ws = parent.lock_working_set(thread, WsLockMode::Unsafe);
            if parent.private_pages() <= count {
                return Ok((store_quota, header_quota, reservation, ws));
            }
            debug!(
                "private pages of {:?} grew past {count} while charging, retrying",
                parent.id()
            );
            drop(ws);
            drop(reservation);
            drop(header_quota);
            drop(store_quota);
            self.config.retry_backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
        }
    }

    /// Copies every descriptor of the parent's registry for a child.
    ///
    /// Pool shortage is waited out with the working-set lock released; a
    /// descriptor that left the registry meanwhile is skipped.
    fn copy_all_descriptors(&self, ws: &mut WorkingSetGuard<'_>) -> Vec<Arc<CloneDescriptor>> {
        let sources = ws
            .clone_root
            .as_ref()
            .map(CloneDescriptorRegistry::snapshot)
            .unwrap_or_default();
        let backoff = self.config.retry_backoff;
        let mut copies = Vec::with_capacity(sources.len());
        for source in sources {
            let mut attempt = 0u32;
            while self.non_paged_pool.allocate(CLONE_DESCRIPTOR_SIZE).is_err() {
                debug!("no pool for a clone descriptor copy, retry {attempt}");
                ws.unlocked(|| backoff.delay(attempt));
                attempt = attempt.saturating_add(1);
            }
            if attempt > 0
                && !ws
                    .clone_root
                    .as_ref()
                    .is_some_and(|registry| registry.contains(&source))
            {
                trace!("clone descriptor at {} went away while waiting", source.start());
                self.non_paged_pool.free(CLONE_DESCRIPTOR_SIZE);
                continue;
            }
            source.header().process_refs().increment();
            copies.push(Arc::new(source.replicate()));
        }
        copies
    }

    fn charge_descriptors(child: &Process, paged: usize, non_paged: usize) {
        if let Err(error) = child.quota().charge(QuotaKind::PagedPool, paged) {
            warn!("clone descriptor charge for {:?} failed: {error}", child.id());
            child.mark_fork_failed();
            return;
        }
        if let Err(error) = child.quota().charge(QuotaKind::NonPagedPool, non_paged) {
            warn!("clone header charge for {:?} failed: {error}", child.id());
            child.quota().release(QuotaKind::PagedPool, paged);
            child.mark_fork_failed();
        }
    }
}

use crate::config::MmConfig;
use crate::error::{ForkError, VadError};
use crate::process::{Process, ProcessId, WsLockMode};
use crate::tb::SoftTlb;
use crate::thread::Thread;
use crate::vad::{ControlArea, Inherit, SectionKind, VAD_SIZE, Vad, VadTree, VadType};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use kernel_alloc::{NonPagedPool, PagedPool, PagingFile, PfnDatabase, QuotaBlock, QuotaKind};
use kernel_memory_addresses::{PAGE_SIZE, PoolAddress, VirtualPageNumber, VirtualPageRange};
use kernel_sync::SpinLock;
use kernel_vmem::hierarchy::{ensure_pte, map_large_page, read_pte};
use kernel_vmem::{FrameAlloc, PageTableMemory, Protection, Pte, PteBits};
use log::debug;

/// Base of the region section prototype PTEs are addressed in.
pub const SECTION_PROTOTYPE_BASE: u64 = 0x0000_6000_0000_0000;

/// The memory manager: the global PFN database, pools and paging file, and
/// the operations that act on process address spaces.
pub struct MemoryManager {
    pub(crate) config: MmConfig,
    pub(crate) pfn: SpinLock<PfnDatabase>,
    pub(crate) paged_pool: PagedPool,
    pub(crate) non_paged_pool: NonPagedPool,
    pub(crate) paging_file: SpinLock<PagingFile>,
    pub(crate) tb: SoftTlb,
    next_process_id: AtomicU32,
    next_prototype: AtomicU64,
}

impl MemoryManager {
    /// Memory manager over `physical_pages` frames and a paging file of
    /// `paging_file_pages` slots.
    #[must_use]
    pub fn new(config: MmConfig, physical_pages: usize, paging_file_pages: u64) -> Self {
        Self {
            config,
            pfn: SpinLock::new(PfnDatabase::new(physical_pages)),
            paged_pool: PagedPool::new(),
            non_paged_pool: NonPagedPool::new(),
            paging_file: SpinLock::new(PagingFile::new(paging_file_pages)),
            tb: SoftTlb::new(),
            next_process_id: AtomicU32::new(1),
            next_prototype: AtomicU64::new(SECTION_PROTOTYPE_BASE),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &MmConfig {
        &self.config
    }

    /// The PFN database behind the PFN lock.
    #[must_use]
    pub const fn pfn(&self) -> &SpinLock<PfnDatabase> {
        &self.pfn
    }

    #[must_use]
    pub const fn paged_pool(&self) -> &PagedPool {
        &self.paged_pool
    }

    #[must_use]
    pub const fn non_paged_pool(&self) -> &NonPagedPool {
        &self.non_paged_pool
    }

    #[must_use]
    pub const fn paging_file(&self) -> &SpinLock<PagingFile> {
        &self.paging_file
    }

    #[must_use]
    pub const fn tb(&self) -> &SoftTlb {
        &self.tb
    }

    /// Creates an empty process with its own top-level paging table.
    ///
    /// # Errors
    /// [`ForkError::InsufficientResources`] when no frame is left for the root table.
    pub fn create_process(&self, quota: QuotaBlock) -> Result<Process, ForkError> {
        let mode = self.config.paging_mode;
        let root = {
            let mut pfn = self.pfn.lock();
            let root = pfn
                .allocate_table(mode.entries(mode.levels()), 0)
                .ok_or(ForkError::InsufficientResources)?;
            pfn.increment_share_count(root);
            root
        };
        let id = ProcessId::new(self.next_process_id.fetch_add(1, Ordering::Relaxed));
        debug!("created {id:?} with root table {root}");
        Ok(Process::new(id, root, quota))
    }

    /// Charges commit and a pool node for `vad` and inserts it.
    ///
    /// # Errors
    /// [`VadError::Overlap`] for a range intersecting an existing VAD, pool
    /// and quota failures as they occur; nothing stays charged on failure.
    pub fn insert_vad(&self, thread: &Thread, process: &Process, vad: Vad) -> Result<(), VadError> {
        let _address_space = process.lock_address_space(thread);
        if process.is_vm_deleted() {
            return Err(VadError::ProcessTerminating);
        }
        let mut ws = process.lock_working_set(thread, WsLockMode::Unsafe);
        self.insert_locked(process, &mut ws.vads, vad)
    }

    fn insert_locked(&self, process: &Process, vads: &mut VadTree, vad: Vad) -> Result<(), VadError> {
        let pages = usize::try_from(vad.range.len()).unwrap_or(usize::MAX);
        let commit = vad.commit_charge;
        self.non_paged_pool.allocate(VAD_SIZE)?;
        if let Err(error) = process.quota().charge(QuotaKind::Commit, commit) {
            self.non_paged_pool.free(VAD_SIZE);
            return Err(error.into());
        }
        if let Err(error) = vads.insert(vad) {
            process.quota().release(QuotaKind::Commit, commit);
            self.non_paged_pool.free(VAD_SIZE);
            return Err(error);
        }
        process.grow_virtual_size(pages);
        Ok(())
    }

    /// Creates a section of `pages` pages whose prototype PTEs are addressed
    /// in a region of their own.
    #[must_use]
    pub fn create_section(&self, pages: u64, kind: SectionKind) -> Arc<ControlArea> {
        let bytes = (pages * 8).div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let prototypes = PoolAddress::new(self.next_prototype.fetch_add(bytes, Ordering::Relaxed));
        Arc::new(ControlArea::new(kind, pages, prototypes))
    }

    /// Maps a view of `section` at `start`.
    ///
    /// Every page of the view gets a Prototype PTE naming the section's
    /// prototype. A `large_page` view is instead mapped by the page
    /// directory entry covering `start`.
    ///
    /// # Errors
    /// As [`MemoryManager::insert_vad`]; [`VadError::OutOfResources`] when a
    /// page table cannot be built, in which case the view stays inserted
    /// with the pages mapped so far.
    #[allow(clippy::too_many_arguments)]
    pub fn map_view(
        &self,
        thread: &Thread,
        process: &Process,
        section: &Arc<ControlArea>,
        start: VirtualPageNumber,
        inherit: Inherit,
        protection: Protection,
        large_page: bool,
    ) -> Result<(), VadError> {
        let kind = match (section.kind(), large_page) {
            (SectionKind::Image, _) => VadType::Image,
            (SectionKind::Data, false) => VadType::MappedFile,
            (SectionKind::Data, true) => VadType::LargePageSection,
        };
        let range = VirtualPageRange::with_len(start, section.pages());

        let _address_space = process.lock_address_space(thread);
        if process.is_vm_deleted() {
            return Err(VadError::ProcessTerminating);
        }
        let mut ws = process.lock_working_set(thread, WsLockMode::Unsafe);
        section.reference_view(protection);
        let vad = Vad::view(kind, range, protection, inherit, Arc::clone(section));
        if let Err(error) = self.insert_locked(process, &mut ws.vads, vad) {
            section.release_view(protection);
            return Err(error);
        }

        let mode = self.config.paging_mode;
        let mut pfn = self.pfn.lock();
        if large_page {
            let frame = pfn.allocate_page(0).ok_or(VadError::OutOfResources)?;
            if let Err(error) = map_large_page(&mut *pfn, mode, process.root(), start, frame, protection) {
                pfn.free_page(frame);
                return Err(error.into());
            }
            debug!("{:?}: large page {frame} at {start}", process.id());
            return Ok(());
        }
        for (index, vpn) in range.iter().enumerate() {
            let at = ensure_pte(&mut *pfn, mode, process.root(), vpn, self.config.color_of(vpn))?;
            if pfn.read(at).is_zero() {
                pfn.increment_used_entries(at.table);
            }
            pfn.write(at, PteBits::prototype_at(section.prototype(index as u64)));
        }
        Ok(())
    }

    /// Decoded PTE of `vpn` in `process`; [`Pte::Zero`] when no page table covers it.
    #[must_use]
    pub fn query_pte(&self, process: &Process, vpn: VirtualPageNumber) -> Pte {
        let pfn = self.pfn.lock();
        read_pte(&*pfn, self.config.paging_mode, process.root(), vpn).decode()
    }

    pub(crate) fn release_paging_file_space(&self, original: PteBits) {
        if let Pte::PageFile { offset, .. } = original.decode()
            && offset != 0
            && !original.decode().is_decommitted()
        {
            self.paging_file.lock().release(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_regions_are_charged() {
        let mm = MemoryManager::new(MmConfig::default(), 64, 16);
        let thread = Thread::new();
        let process = mm
            .create_process(QuotaBlock::with_limits(usize::MAX, usize::MAX, 8))
            .unwrap();
        let range = VirtualPageRange::with_len(VirtualPageNumber::new(0x100), 6);
        mm.insert_vad(&thread, &process, Vad::private(range, Protection::READWRITE)).unwrap();

        assert_eq!(process.virtual_size(), 6);
        assert_eq!(process.quota().usage(QuotaKind::Commit), 6);
        assert_eq!(mm.non_paged_pool().bytes_in_use(), VAD_SIZE);

        let overlapping = VirtualPageRange::with_len(VirtualPageNumber::new(0x105), 1);
        let err = mm
            .insert_vad(&thread, &process, Vad::private(overlapping, Protection::READWRITE))
            .unwrap_err();
        assert!(matches!(err, VadError::Overlap { .. }));

        let too_big = VirtualPageRange::with_len(VirtualPageNumber::new(0x200), 3);
        let err = mm
            .insert_vad(&thread, &process, Vad::private(too_big, Protection::READWRITE))
            .unwrap_err();
        assert!(matches!(err, VadError::Quota(_)));
        assert_eq!(process.quota().usage(QuotaKind::Commit), 6);
        assert_eq!(mm.non_paged_pool().bytes_in_use(), VAD_SIZE);
    }

    #[test]
    fn view_pages_point_at_section_prototypes() {
        let mm = MemoryManager::new(MmConfig::default(), 64, 16);
        let thread = Thread::new();
        let process = mm.create_process(QuotaBlock::unlimited()).unwrap();
        let section = mm.create_section(3, SectionKind::Data);
        let start = VirtualPageNumber::new(0x400);
        mm.map_view(&thread, &process, &section, start, Inherit::Share, Protection::READONLY, false)
            .unwrap();

        assert_eq!(
            mm.query_pte(&process, start.next()),
            Pte::Prototype { proto: section.prototype(1) }
        );
        assert_eq!(section.mapped_views(), 1);
        assert_eq!(section.writable_user_references(), 0);
    }

    #[test]
    fn sections_get_disjoint_prototype_ranges() {
        let mm = MemoryManager::new(MmConfig::default(), 8, 0);
        let a = mm.create_section(600, SectionKind::Data);
        let b = mm.create_section(1, SectionKind::Image);
        assert!(!a.owns_prototype(b.prototype(0)));
        assert!(a.owns_prototype(a.prototype(599)));
    }
}

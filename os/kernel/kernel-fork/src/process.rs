//! # Processes and their locks
//!
//! A [`Process`] owns two locks, always taken in this order:
//!
//! 1. the address-space lock: serialises VAD creation and deletion and is
//!    held by fork for the whole clone,
//! 2. the working-set lock: protects the VAD tree, the page tables (with
//!    the PFN lock) and the clone descriptor registry.
//!
//! Fault paths take the working-set lock only. They call
//! [`MemoryManager::wait_for_fork_to_complete`](crate::MemoryManager::wait_for_fork_to_complete)
//! first, which uses the address-space lock as a rendezvous with a fork in
//! progress on another thread.

use crate::clone::{CloneDescriptor, CloneDescriptorRegistry};
use crate::thread::Thread;
use crate::vad::VadTree;
use alloc::sync::Arc;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use kernel_alloc::QuotaBlock;
use kernel_memory_addresses::{PageFrameNumber, PoolAddress};
use kernel_sync::{MutexGuard, RawSpin, RawTicket, SpinMutex, TicketMutex};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process({})", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const VM_DELETED: u32 = 1 << 0;
const FORK_FAILED: u32 = 1 << 1;

/// How the working-set lock was acquired; every temporary release restores
/// the same mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WsLockMode {
    /// The acquisition enters a guarded region.
    Safe,
    /// The caller is already in a guarded region.
    Unsafe,
}

/// State guarded by the working-set lock.
#[derive(Default)]
pub struct WorkingSet {
    pub(crate) vads: VadTree,
    /// Allocated on the first fork and kept until the process exits.
    pub(crate) clone_root: Option<CloneDescriptorRegistry>,
}

impl WorkingSet {
    #[must_use]
    pub const fn vads(&self) -> &VadTree {
        &self.vads
    }

    #[must_use]
    pub const fn clone_root(&self) -> Option<&CloneDescriptorRegistry> {
        self.clone_root.as_ref()
    }

    /// Descriptor of this process whose store holds `proto`.
    pub(crate) fn clone_descriptor(&self, proto: PoolAddress) -> Option<Arc<CloneDescriptor>> {
        self.clone_root.as_ref()?.find_containing(proto).cloned()
    }
}

/// Marks the thread, if any, that is cloning this process.
///
/// Fault handlers in sibling threads check it before touching clone
/// descriptor counts and wait for the fork to finish.
#[derive(Default)]
pub struct ForkGate {
    owner: AtomicU64,
}

impl ForkGate {
    #[must_use]
    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Whether a fork is running on a thread other than `thread`.
    #[must_use]
    pub fn is_active_for_other(&self, thread: &Thread) -> bool {
        self.owner().is_some_and(|owner| owner != thread.id().as_u64())
    }

    #[must_use]
    pub fn is_owned_by(&self, thread: &Thread) -> bool {
        self.owner() == Some(thread.id().as_u64())
    }

    /// Marks `thread` as forking until the returned guard is dropped.
    ///
    /// Callers hold the address-space lock, so at most one fork is marked.
    pub fn begin(&self, thread: &Thread) -> ForkInProgress<'_> {
        let previous = self.owner.swap(thread.id().as_u64(), Ordering::AcqRel);
        debug_assert_eq!(previous, 0, "fork already in progress");
        ForkInProgress { gate: self }
    }
}

#[must_use]
pub struct ForkInProgress<'a> {
    gate: &'a ForkGate,
}

impl Drop for ForkInProgress<'_> {
    fn drop(&mut self) {
        self.gate.owner.store(0, Ordering::Release);
    }
}

pub struct Process {
    id: ProcessId,
    root: PageFrameNumber,
    flags: AtomicU32,
    private_pages: AtomicUsize,
    virtual_size: AtomicUsize,
    peak_virtual_size: AtomicUsize,
    quota: QuotaBlock,
    fork_gate: ForkGate,
    address_space: SpinMutex<()>,
    working_set: TicketMutex<WorkingSet>,
}

impl Process {
    pub(crate) fn new(id: ProcessId, root: PageFrameNumber, quota: QuotaBlock) -> Self {
        Self {
            id,
            root,
            flags: AtomicU32::new(0),
            private_pages: AtomicUsize::new(0),
            virtual_size: AtomicUsize::new(0),
            peak_virtual_size: AtomicUsize::new(0),
            quota,
            fork_gate: ForkGate::default(),
            address_space: SpinMutex::new(()),
            working_set: TicketMutex::new(WorkingSet::default()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ProcessId {
        self.id
    }

    /// Frame of the top-level paging table.
    #[must_use]
    pub const fn root(&self) -> PageFrameNumber {
        self.root
    }

    #[must_use]
    pub const fn quota(&self) -> &QuotaBlock {
        &self.quota
    }

    #[must_use]
    pub const fn fork_gate(&self) -> &ForkGate {
        &self.fork_gate
    }

    /// Pages private to this process: resident, in transition or in the paging file.
    #[must_use]
    pub fn private_pages(&self) -> usize {
        self.private_pages.load(Ordering::Acquire)
    }

    /// Committed virtual size in pages.
    #[must_use]
    pub fn virtual_size(&self) -> usize {
        self.virtual_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peak_virtual_size(&self) -> usize {
        self.peak_virtual_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_vm_deleted(&self) -> bool {
        self.flags.load(Ordering::Acquire) & VM_DELETED != 0
    }

    /// Set on a child whose fork could not be completed; such a child must
    /// be destroyed, not run.
    #[must_use]
    pub fn fork_failed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FORK_FAILED != 0
    }

    pub(crate) fn mark_vm_deleted(&self) {
        self.flags.fetch_or(VM_DELETED, Ordering::AcqRel);
    }

    pub(crate) fn mark_fork_failed(&self) {
        self.flags.fetch_or(FORK_FAILED, Ordering::AcqRel);
    }

    pub(crate) fn add_private_pages(&self, pages: usize) {
        self.private_pages.fetch_add(pages, Ordering::AcqRel);
    }

    pub(crate) fn remove_private_pages(&self, pages: usize) {
        let previous = self.private_pages.fetch_sub(pages, Ordering::AcqRel);
        debug_assert!(previous >= pages, "private page count underflow in {:?}", self.id);
    }

    pub(crate) fn set_private_pages(&self, pages: usize) {
        self.private_pages.store(pages, Ordering::Release);
    }

    pub(crate) fn grow_virtual_size(&self, pages: usize) {
        let size = self.virtual_size.fetch_add(pages, Ordering::AcqRel) + pages;
        self.peak_virtual_size.fetch_max(size, Ordering::AcqRel);
    }

    pub(crate) fn shrink_virtual_size(&self, pages: usize) {
        self.virtual_size.fetch_sub(pages, Ordering::AcqRel);
    }

    /// Takes the address-space lock; the thread stays in a guarded region
    /// while it is held.
    pub fn lock_address_space<'a>(&'a self, thread: &'a Thread) -> AddressSpaceGuard<'a> {
        thread.enter_guarded_region();
        AddressSpaceGuard {
            thread,
            _guard: self.address_space.lock(),
        }
    }

    /// Acquire and immediately release the address-space lock.
    pub(crate) fn rendezvous_address_space(&self) {
        drop(self.address_space.lock());
    }

    pub fn lock_working_set<'a>(&'a self, thread: &'a Thread, mode: WsLockMode) -> WorkingSetGuard<'a> {
        match mode {
            WsLockMode::Safe => thread.enter_guarded_region(),
            WsLockMode::Unsafe => debug_assert!(thread.in_guarded_region()),
        }
        WorkingSetGuard {
            process: self,
            thread,
            mode,
            guard: self.working_set.lock(),
        }
    }
}

#[must_use]
pub struct AddressSpaceGuard<'a> {
    thread: &'a Thread,
    _guard: MutexGuard<'a, (), RawSpin>,
}

impl Drop for AddressSpaceGuard<'_> {
    fn drop(&mut self) {
        self.thread.leave_guarded_region();
    }
}

#[must_use]
pub struct WorkingSetGuard<'a> {
    process: &'a Process,
    thread: &'a Thread,
    mode: WsLockMode,
    guard: MutexGuard<'a, WorkingSet, RawTicket>,
}

impl<'a> WorkingSetGuard<'a> {
    #[must_use]
    pub const fn process(&self) -> &'a Process {
        self.process
    }

    #[must_use]
    pub const fn thread(&self) -> &'a Thread {
        self.thread
    }

    #[must_use]
    pub const fn mode(&self) -> WsLockMode {
        self.mode
    }

    /// Releases the working-set lock around `f` and re-acquires it in the
    /// same mode, also when `f` unwinds.
    pub fn unlocked<U>(&mut self, f: impl FnOnce() -> U) -> U {
        let thread = self.thread;
        let safe = self.mode == WsLockMode::Safe;
        self.guard.unlocked(|| {
            let _outside = safe.then(|| OutsideGuardedRegion::leave(thread));
            f()
        })
    }
}

/// Leaves the thread's guarded region until dropped.
struct OutsideGuardedRegion<'a> {
    thread: &'a Thread,
}

impl<'a> OutsideGuardedRegion<'a> {
    fn leave(thread: &'a Thread) -> Self {
        thread.leave_guarded_region();
        Self { thread }
    }
}

impl Drop for OutsideGuardedRegion<'_> {
    fn drop(&mut self) {
        self.thread.enter_guarded_region();
    }
}

impl Deref for WorkingSetGuard<'_> {
    type Target = WorkingSet;

    fn deref(&self) -> &WorkingSet {
        &self.guard
    }
}

impl DerefMut for WorkingSetGuard<'_> {
    fn deref_mut(&mut self) -> &mut WorkingSet {
        &mut self.guard
    }
}

impl Drop for WorkingSetGuard<'_> {
    fn drop(&mut self) {
        if self.mode == WsLockMode::Safe {
            self.thread.leave_guarded_region();
        }
    }
}

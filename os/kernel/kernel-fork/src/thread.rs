use crate::process::ProcessId;
use core::cell::Cell;
use core::fmt;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// A kernel thread as the memory manager sees it.
///
/// Tracks guarded-region nesting (entered while the address-space lock or a
/// safely acquired working-set lock is held) and the process it is
/// attached to. A `Thread` is owned by the OS thread running it.
pub struct Thread {
    id: ThreadId,
    guarded_regions: Cell<u32>,
    attached: Cell<Option<ProcessId>>,
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

impl Thread {
    #[must_use]
    pub fn new() -> Self {
        let id = NonZeroU64::MIN.saturating_add(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            id: ThreadId(id),
            guarded_regions: Cell::new(0),
            attached: Cell::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    pub fn enter_guarded_region(&self) {
        self.guarded_regions.set(self.guarded_regions.get() + 1);
    }

    pub fn leave_guarded_region(&self) {
        let depth = self.guarded_regions.get();
        debug_assert!(depth > 0, "unbalanced guarded region on {:?}", self.id);
        self.guarded_regions.set(depth.saturating_sub(1));
    }

    #[must_use]
    pub fn in_guarded_region(&self) -> bool {
        self.guarded_regions.get() > 0
    }

    #[must_use]
    pub fn attached_process(&self) -> Option<ProcessId> {
        self.attached.get()
    }

    /// Attaches to `process` until the returned guard is dropped.
    pub fn attach(&self, process: ProcessId) -> AttachGuard<'_> {
        let previous = self.attached.replace(Some(process));
        AttachGuard {
            thread: self,
            previous,
        }
    }
}

#[must_use]
pub struct AttachGuard<'a> {
    thread: &'a Thread,
    previous: Option<ProcessId>,
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        self.thread.attached.set(self.previous);
    }
}

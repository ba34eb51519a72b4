//! The three reference-count tiers of fork sharing.
//!
//! | Tier | Type | Counts | Last holder |
//! |------|------|--------|-------------|
//! | block | [`BlockRefCount`] | PTEs of all processes naming the block | retires the saved page |
//! | descriptor | [`DescriptorRefs`] | PTEs of one process inside the descriptor's range | detaches, then frees the descriptor |
//! | header | [`ProcessRefs`] | processes holding a descriptor of the header | frees header and store |

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering, fence};

/// Reference count of one clone block.
#[derive(Debug)]
pub struct BlockRefCount(AtomicI32);

impl BlockRefCount {
    #[must_use]
    pub const fn new(count: i32) -> Self {
        Self(AtomicI32::new(count))
    }

    #[must_use]
    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference; `true` for the last one.
    pub fn decrement(&self) -> bool {
        let previous = self.0.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "clone block reference count underflow");
        if previous == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }
}

/// Events raised when a descriptor count drops to zero.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RefEvent {
    /// No PTE of the process references the descriptor any more; it must
    /// leave the registry.
    OnLastLiveReferenceDropped,
    /// Every decrement has finished its side effects; the descriptor may be
    /// freed.
    OnLastPendingOperationDropped,
}

/// The two counts of a clone descriptor.
///
/// `live` is decremented first, `pending` once the decrement is complete.
/// The two are equal whenever no decrement is in flight.
#[derive(Debug)]
pub struct DescriptorRefs {
    live: AtomicUsize,
    pending: AtomicUsize,
}

impl DescriptorRefs {
    #[must_use]
    pub const fn new(count: usize) -> Self {
        Self {
            live: AtomicUsize::new(count),
            pending: AtomicUsize::new(count),
        }
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn release_live(&self) -> Option<RefEvent> {
        let previous = self.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "descriptor live count underflow");
        (previous == 1).then_some(RefEvent::OnLastLiveReferenceDropped)
    }

    #[must_use]
    pub fn release_pending(&self) -> Option<RefEvent> {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "descriptor pending count underflow");
        (previous == 1).then_some(RefEvent::OnLastPendingOperationDropped)
    }

    /// Snapshot for a replicated descriptor, with `pending` clamped to `live`.
    ///
    /// A decrement of the source may be parked between its two halves; the
    /// copy must not inherit a pending count it can never drain.
    #[must_use]
    pub fn clamped_copy(&self) -> Self {
        let live = self.live();
        Self {
            live: AtomicUsize::new(live),
            pending: AtomicUsize::new(self.pending().min(live)),
        }
    }
}

/// Number of processes holding a descriptor of one clone header.
#[derive(Debug)]
pub struct ProcessRefs(AtomicU32);

impl ProcessRefs {
    #[must_use]
    pub const fn new(count: u32) -> Self {
        Self(AtomicU32::new(count))
    }

    #[must_use]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// `true` when the last process let go.
    pub fn release(&self) -> bool {
        let previous = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "header process count underflow");
        previous == 1
    }
}

//! # Process Quota
//!
//! Per-process charges against paged pool, non-paged pool and commit.
//! Charges are lock-free; a charge either fits under the limit in full or
//! is refused without side effects.

use core::sync::atomic::{AtomicUsize, Ordering};
use log::trace;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QuotaKind {
    PagedPool,
    NonPagedPool,
    /// Committed pages.
    Commit,
}

impl QuotaKind {
    const fn slot(self) -> usize {
        match self {
            Self::PagedPool => 0,
            Self::NonPagedPool => 1,
            Self::Commit => 2,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum QuotaError {
    #[error("{kind:?} quota exceeded: requested {requested}, available {available}")]
    Exceeded {
        kind: QuotaKind,
        requested: usize,
        available: usize,
    },
}

#[derive(Debug)]
pub struct QuotaBlock {
    usage: [AtomicUsize; 3],
    limits: [usize; 3],
}

impl Default for QuotaBlock {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl QuotaBlock {
    #[must_use]
    pub const fn unlimited() -> Self {
        Self::with_limits(usize::MAX, usize::MAX, usize::MAX)
    }

    #[must_use]
    pub const fn with_limits(paged_pool: usize, non_paged_pool: usize, commit: usize) -> Self {
        Self {
            usage: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
            limits: [paged_pool, non_paged_pool, commit],
        }
    }

    /// Charges `amount` against `kind`.
    ///
    /// # Errors
    /// [`QuotaError::Exceeded`] if the charge does not fit; nothing is charged then.
    pub fn charge(&self, kind: QuotaKind, amount: usize) -> Result<(), QuotaError> {
        let limit = self.limits[kind.slot()];
        let usage = &self.usage[kind.slot()];
        let mut current = usage.load(Ordering::Relaxed);
        loop {
            let available = limit.saturating_sub(current);
            if amount > available {
                trace!("{kind:?} quota refused: {amount} > {available}");
                return Err(QuotaError::Exceeded {
                    kind,
                    requested: amount,
                    available,
                });
            }
            match usage.compare_exchange_weak(current, current + amount, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns a previous charge.
    pub fn release(&self, kind: QuotaKind, amount: usize) {
        let previous = self.usage[kind.slot()].fetch_sub(amount, Ordering::AcqRel);
        debug_assert!(previous >= amount, "{kind:?} quota returned more than charged");
    }

    #[must_use]
    pub fn usage(&self, kind: QuotaKind) -> usize {
        self.usage[kind.slot()].load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn limit(&self, kind: QuotaKind) -> usize {
        self.limits[kind.slot()]
    }
}

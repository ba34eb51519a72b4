use crate::PoolError;
use crate::failure::{FailureInjector, FailurePlan};
use kernel_sync::SpinLock;

#[derive(Default)]
struct NonPagedState {
    bytes_in_use: usize,
    allocations: usize,
    failures: FailureInjector,
}

/// Byte accounting for always-resident pool.
///
/// Objects themselves live on the heap; this only tracks what they would
/// cost so that callers can verify every charge is returned.
pub struct NonPagedPool {
    inner: SpinLock<NonPagedState>,
}

impl Default for NonPagedPool {
    fn default() -> Self {
        Self::new()
    }
}

impl NonPagedPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(NonPagedState::default()),
        }
    }

    /// # Errors
    /// [`PoolError::Exhausted`] when the allocation is refused.
    pub fn allocate(&self, bytes: usize) -> Result<(), PoolError> {
        let mut state = self.inner.lock();
        if state.failures.should_fail() {
            return Err(PoolError::Exhausted { requested: bytes });
        }
        state.bytes_in_use += bytes;
        state.allocations += 1;
        Ok(())
    }

    pub fn free(&self, bytes: usize) {
        let mut state = self.inner.lock();
        debug_assert!(state.bytes_in_use >= bytes && state.allocations > 0);
        state.bytes_in_use -= bytes;
        state.allocations -= 1;
    }

    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.inner.lock().bytes_in_use
    }

    #[must_use]
    pub fn allocations(&self) -> usize {
        self.inner.lock().allocations
    }

    pub fn inject_failures(&self, plan: FailurePlan) {
        self.inner.lock().failures.arm(plan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_balances() {
        let pool = NonPagedPool::new();
        pool.allocate(48).unwrap();
        pool.allocate(16).unwrap();
        assert_eq!(pool.bytes_in_use(), 64);
        pool.free(48);
        pool.free(16);
        assert_eq!(pool.allocations(), 0);
    }

    #[test]
    fn injected_failure_charges_nothing() {
        let pool = NonPagedPool::new();
        pool.inject_failures(FailurePlan::transient(1));
        assert_eq!(pool.allocate(8), Err(PoolError::Exhausted { requested: 8 }));
        assert_eq!(pool.bytes_in_use(), 0);
    }
}

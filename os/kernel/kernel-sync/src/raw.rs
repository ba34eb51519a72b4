//! Raw lock words without data. [`crate::Mutex`] pairs one of them with the
//! value it protects.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A lock word usable by [`crate::Mutex`].
///
/// # Safety
/// `lock` and a successful `try_lock` must establish mutual exclusion until
/// the matching `unlock`.
pub unsafe trait RawLock {
    fn lock(&self);
    fn try_lock(&self) -> bool;
    fn is_locked(&self) -> bool;

    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn unlock(&self);
}

/// Holds a lock word released until dropped, then takes it again.
///
/// `unlocked` on the guards goes through this so that a closure that
/// unwinds still leaves the lock held for the guard's own drop.
pub(crate) struct Relock<'a, R: RawLock> {
    raw: &'a R,
}

impl<'a, R: RawLock> Relock<'a, R> {
    /// # Safety
    /// The caller must currently hold `raw`.
    pub(crate) unsafe fn release(raw: &'a R) -> Self {
        // Safety: held by the caller; re-acquired by `drop`.
        unsafe { raw.unlock() };
        Self { raw }
    }
}

impl<R: RawLock> Drop for Relock<'_, R> {
    fn drop(&mut self) {
        self.raw.lock();
    }
}

/// Test-and-test-and-set lock word.
#[derive(Default)]
pub struct RawSpin {
    held: AtomicBool,
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }
}

unsafe impl RawLock for RawSpin {
    #[inline]
    fn lock(&self) {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// FIFO ticket lock. Waiters are served in arrival order, so a thread that
/// drops the lock and immediately asks for it again queues behind everyone
/// already waiting.
#[derive(Default)]
pub struct RawTicket {
    next: AtomicUsize,
    serving: AtomicUsize,
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            serving: AtomicUsize::new(0),
        }
    }

    /// Number of threads holding or waiting for the lock.
    #[inline]
    pub fn queue_depth(&self) -> usize {
        self.next
            .load(Ordering::Relaxed)
            .wrapping_sub(self.serving.load(Ordering::Relaxed))
    }
}

unsafe impl RawLock for RawTicket {
    #[inline]
    fn lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        let serving = self.serving.load(Ordering::Relaxed);
        self.next
            .compare_exchange(serving, serving.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.queue_depth() != 0
    }

    #[inline]
    unsafe fn unlock(&self) {
        // only the holder writes `serving`
        let current = self.serving.load(Ordering::Relaxed);
        self.serving.store(current.wrapping_add(1), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_try_lock_only_when_nobody_queues() {
        let raw = RawTicket::new();
        assert!(raw.try_lock());
        assert!(!raw.try_lock());
        assert_eq!(raw.queue_depth(), 1);
        unsafe { raw.unlock() };
        assert!(!raw.is_locked());
        assert!(raw.try_lock());
        unsafe { raw.unlock() };
    }

    #[test]
    fn spin_word_round_trips() {
        let raw = RawSpin::new();
        raw.lock();
        assert!(raw.is_locked());
        assert!(!raw.try_lock());
        unsafe { raw.unlock() };
        assert!(raw.try_lock());
    }
}

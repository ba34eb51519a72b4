use crate::raw::Relock;
use crate::{RawLock, RawSpin};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// Spin lock owning its data.
///
/// Used for short, bounded critical sections such as the PFN database. Unlike
/// [`crate::SpinMutex`] the guard is the only way in; there is no raw access.
pub struct SpinLock<T> {
    raw: RawSpin,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            raw: RawSpin::new(),
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.raw.try_lock().then_some(SpinLockGuard { lock: self })
    }

    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    /// Whether any thread currently holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

#[must_use]
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLockGuard<'_, T> {
    /// Releases the lock, runs `f`, and spins until the lock is held again.
    ///
    /// Anything read through the guard before the call must be re-validated
    /// afterwards. The lock is held again even if `f` unwinds.
    #[inline]
    pub fn unlocked<U>(&mut self, f: impl FnOnce() -> U) -> U {
        // Safety: a live guard holds the lock.
        let _relock = unsafe { Relock::release(&self.lock.raw) };
        f()
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Safety: taken by `lock` or a successful `try_lock`.
        unsafe { self.lock.raw.unlock() }
    }
}

use crate::RawLock;
use crate::raw::Relock;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// Data protected by a pluggable raw lock `R`.
pub struct Mutex<T, R> {
    raw: R,
    cell: UnsafeCell<T>,
    _not_auto: PhantomData<*mut ()>,
}

// Safety: access to T is serialised by R.
unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
            _not_auto: PhantomData,
        }
    }

    #[inline]
    pub const fn raw(&self) -> &R {
        &self.raw
    }
}

#[must_use]
pub struct MutexGuard<'a, T, R>
where
    R: RawLock,
{
    m: &'a Mutex<T, R>,
}

impl<T, R> MutexGuard<'_, T, R>
where
    R: RawLock,
{
    /// Releases the lock, runs `f`, and re-acquires the lock before returning.
    ///
    /// The protected value may have been changed by other threads while `f` ran.
    /// If `f` panics the lock is taken again before unwinding reaches the guard.
    #[inline]
    pub fn unlocked<U>(&mut self, f: impl FnOnce() -> U) -> U {
        // Safety: a live guard holds the lock.
        let _relock = unsafe { Relock::release(&self.m.raw) };
        f()
    }
}

impl<T, R> Deref for MutexGuard<'_, T, R>
where
    R: RawLock,
{
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.m.cell.get() }
    }
}

impl<T, R> DerefMut for MutexGuard<'_, T, R>
where
    R: RawLock,
{
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T, R> Drop for MutexGuard<'_, T, R>
where
    R: RawLock,
{
    fn drop(&mut self) {
        // Safety: taken by `lock` or a successful `try_lock`.
        unsafe { self.m.raw.unlock() }
    }
}

impl<T, R> Mutex<T, R>
where
    R: RawLock,
{
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.lock();
        MutexGuard { m: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        if self.raw.try_lock() {
            Some(MutexGuard { m: self })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

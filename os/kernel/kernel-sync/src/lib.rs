//! # Kernel synchronization primitives
//!
//! Locks used by the memory manager, in acquisition order:
//!
//! 1. the per-process address-space lock ([`SpinMutex`]),
//! 2. the per-process working-set lock ([`TicketMutex`], fair under contention),
//! 3. the global PFN-database lock ([`SpinLock`]).
//!
//! Every guard can temporarily give up its lock through `unlocked`, which
//! runs a closure with the lock released and re-acquires it before
//! returning. Callers must re-validate whatever they read under the lock.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw;
mod spin_lock;

pub use mutex::{Mutex, MutexGuard};
pub use raw::{RawLock, RawSpin, RawTicket};
pub use spin_lock::{SpinLock, SpinLockGuard};

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

//! # Paged Pool
//!
//! System pool whose pages may be trimmed out of memory. Every allocation
//! starts on its own page. A page stays resident while it is locked or
//! while its share count is non-zero (frames whose PTE is a prototype in
//! that page); [`PagedPool::trim`] evicts the rest, and
//! [`PagedPool::make_resident`] brings a page back in. The pool lock is a
//! leaf lock and may be taken with any other lock held.

use crate::PoolError;
use crate::failure::{FailureInjector, FailurePlan};
use alloc::collections::BTreeMap;
use kernel_memory_addresses::{PAGE_SIZE, PoolAddress, PoolPage};
use kernel_sync::SpinLock;
use log::{debug, trace};

/// Base address of paged pool.
pub const PAGED_POOL_BASE: u64 = 0x0000_5000_0000_0000;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolPageState {
    pub resident: bool,
    pub lock_count: u32,
    pub share_count: u32,
}

#[derive(Default)]
struct PagedPoolState {
    next: u64,
    allocations: BTreeMap<PoolAddress, u64>,
    pages: BTreeMap<PoolPage, PoolPageState>,
    bytes_in_use: usize,
    failures: FailureInjector,
}

pub struct PagedPool {
    inner: SpinLock<PagedPoolState>,
}

impl Default for PagedPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PagedPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(PagedPoolState {
                next: PAGED_POOL_BASE,
                ..PagedPoolState::default()
            }),
        }
    }

    /// Allocates `bytes` of resident, unlocked pool.
    ///
    /// # Errors
    /// [`PoolError::Exhausted`] when the allocation is refused.
    pub fn allocate(&self, bytes: usize) -> Result<PoolAddress, PoolError> {
        let mut state = self.inner.lock();
        if state.failures.should_fail() {
            return Err(PoolError::Exhausted { requested: bytes });
        }
        let base = PoolAddress::new(state.next);
        let size = bytes.max(1) as u64;
        state.next += size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        for page in PoolPage::span(base, size) {
            state.pages.insert(
                page,
                PoolPageState {
                    resident: true,
                    ..PoolPageState::default()
                },
            );
        }
        state.allocations.insert(base, size);
        state.bytes_in_use += bytes;
        trace!("paged pool: {bytes} bytes at {base}");
        Ok(base)
    }

    /// Frees the allocation starting at `base`.
    ///
    /// # Panics
    /// Panics if `base` is not the start of a live allocation.
    pub fn free(&self, base: PoolAddress, bytes: usize) {
        let mut state = self.inner.lock();
        let Some(size) = state.allocations.remove(&base) else {
            panic!("paged pool: free of unknown allocation {base}");
        };
        for page in PoolPage::span(base, size) {
            if let Some(removed) = state.pages.remove(&page) {
                debug_assert_eq!(removed.lock_count, 0, "freeing locked pool page {page:?}");
            }
        }
        state.bytes_in_use -= bytes;
    }

    /// Locks every page of `[base, base + bytes)` resident.
    pub fn lock_range(&self, base: PoolAddress, bytes: usize) {
        for page in PoolPage::span(base, bytes as u64) {
            self.lock_page(page);
        }
    }

    pub fn unlock_range(&self, base: PoolAddress, bytes: usize) {
        for page in PoolPage::span(base, bytes as u64) {
            self.unlock_page(page);
        }
    }

    /// Pins one page resident, faulting it in if needed.
    pub fn lock_page(&self, page: PoolPage) {
        self.with_page(page, |state| {
            state.resident = true;
            state.lock_count += 1;
        });
    }

    pub fn unlock_page(&self, page: PoolPage) {
        self.with_page(page, |state| {
            debug_assert!(state.lock_count > 0, "unbalanced unlock of {page:?}");
            state.lock_count = state.lock_count.saturating_sub(1);
        });
    }

    /// Adds a share count on behalf of a frame whose PTE lives in `page`.
    pub fn increment_share(&self, page: PoolPage) {
        self.with_page(page, |state| {
            debug_assert!(state.resident, "share taken on non-resident {page:?}");
            state.share_count += 1;
        });
    }

    pub fn decrement_share(&self, page: PoolPage) {
        self.with_page(page, |state| {
            debug_assert!(state.share_count > 0, "share count underflow on {page:?}");
            state.share_count = state.share_count.saturating_sub(1);
        });
    }

    #[must_use]
    pub fn is_resident(&self, address: PoolAddress) -> bool {
        self.inner
            .lock()
            .pages
            .get(&address.page())
            .is_some_and(|state| state.resident)
    }

    /// Faults the page holding `address` back in.
    pub fn make_resident(&self, address: PoolAddress) {
        self.with_page(address.page(), |state| state.resident = true);
    }

    #[must_use]
    pub fn page_state(&self, page: PoolPage) -> Option<PoolPageState> {
        self.inner.lock().pages.get(&page).copied()
    }

    /// Evicts every resident page that is neither locked nor shared.
    /// Returns the number of pages evicted.
    pub fn trim(&self) -> usize {
        let mut state = self.inner.lock();
        let mut evicted = 0;
        for page in state.pages.values_mut() {
            if page.resident && page.lock_count == 0 && page.share_count == 0 {
                page.resident = false;
                evicted += 1;
            }
        }
        debug!("paged pool: trimmed {evicted} pages");
        evicted
    }

    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.inner.lock().bytes_in_use
    }

    #[must_use]
    pub fn allocations(&self) -> usize {
        self.inner.lock().allocations.len()
    }

    pub fn inject_failures(&self, plan: FailurePlan) {
        self.inner.lock().failures.arm(plan);
    }

    fn with_page(&self, page: PoolPage, f: impl FnOnce(&mut PoolPageState)) {
        let mut state = self.inner.lock();
        let Some(page_state) = state.pages.get_mut(&page) else {
            panic!("paged pool: {page:?} is not allocated");
        };
        f(page_state);
    }
}

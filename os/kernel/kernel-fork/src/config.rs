//! Memory-manager tunables.

use core::hint::spin_loop;
use kernel_memory_addresses::VirtualPageNumber;
use kernel_vmem::PagingMode;

/// Spin delay between retries of an operation that waits for transient
/// pool pressure to go away.
///
/// The delay doubles per attempt and saturates at `max_spins`; callers retry
/// without an attempt limit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Backoff {
    pub initial_spins: u32,
    pub max_spins: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(16, 4096)
    }
}

impl Backoff {
    #[must_use]
    pub const fn new(initial_spins: u32, max_spins: u32) -> Self {
        Self {
            initial_spins,
            max_spins,
        }
    }

    /// Spins for retry `attempt` (0-based).
    #[must_use]
    pub const fn spins(&self, attempt: u32) -> u32 {
        let shift = if attempt > 32 { 32 } else { attempt };
        let spins = (self.initial_spins as u64) << shift;
        if spins > self.max_spins as u64 {
            self.max_spins
        } else {
            #[allow(clippy::cast_possible_truncation)]
            {
                spins as u32
            }
        }
    }

    pub fn delay(&self, attempt: u32) {
        for _ in 0..self.spins(attempt) {
            spin_loop();
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MmConfig {
    pub paging_mode: PagingMode,
    /// Delay policy of the quota re-check and descriptor replication loops.
    pub retry_backoff: Backoff,
    /// Number of page colors; allocation color hints are `vpn % page_colors`.
    pub page_colors: u32,
    /// Entries a pending TB flush list holds before it degrades to a full flush.
    pub flush_list_capacity: usize,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            paging_mode: PagingMode::FourLevel,
            retry_backoff: Backoff::default(),
            page_colors: 64,
            flush_list_capacity: 16,
        }
    }
}

impl MmConfig {
    #[must_use]
    pub const fn with_paging_mode(mut self, paging_mode: PagingMode) -> Self {
        self.paging_mode = paging_mode;
        self
    }

    #[must_use]
    pub const fn with_retry_backoff(mut self, retry_backoff: Backoff) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    #[must_use]
    pub const fn with_page_colors(mut self, page_colors: u32) -> Self {
        self.page_colors = page_colors;
        self
    }

    #[must_use]
    pub const fn with_flush_list_capacity(mut self, flush_list_capacity: usize) -> Self {
        self.flush_list_capacity = flush_list_capacity;
        self
    }

    /// Allocation color hint for a page backing `vpn`.
    #[must_use]
    pub const fn color_of(&self, vpn: VirtualPageNumber) -> u32 {
        let colors = if self.page_colors == 0 { 1 } else { self.page_colors as u64 };
        #[allow(clippy::cast_possible_truncation)]
        {
            (vpn.as_u64() % colors) as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_saturates() {
        let backoff = Backoff::new(4, 20);
        let spins: Vec<u32> = (0..5).map(|attempt| backoff.spins(attempt)).collect();
        assert_eq!(spins, vec![4, 8, 16, 20, 20]);
        assert_eq!(backoff.spins(u32::MAX), 20);
    }

    #[test]
    fn colors_wrap() {
        let config = MmConfig::default().with_page_colors(8);
        assert_eq!(config.color_of(VirtualPageNumber::new(13)), 5);
        assert_eq!(MmConfig::default().with_page_colors(0).color_of(VirtualPageNumber::new(13)), 0);
    }
}

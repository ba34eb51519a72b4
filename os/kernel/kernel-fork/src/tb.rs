//! Translation buffer model: counts the flushes each process receives.

use crate::process::ProcessId;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualPageNumber;
use kernel_sync::SpinLock;
use log::trace;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TbStats {
    pub entire: usize,
    pub single: usize,
}

pub struct SoftTlb {
    stats: SpinLock<BTreeMap<ProcessId, TbStats>>,
}

impl Default for SoftTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftTlb {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stats: SpinLock::new(BTreeMap::new()),
        }
    }

    pub fn flush_entire(&self, process: ProcessId) {
        trace!("flush entire TB of {process:?}");
        self.stats.lock().entry(process).or_default().entire += 1;
    }

    pub fn flush_single(&self, process: ProcessId, vpn: VirtualPageNumber) {
        trace!("flush TB entry {vpn} of {process:?}");
        self.stats.lock().entry(process).or_default().single += 1;
    }

    #[must_use]
    pub fn stats(&self, process: ProcessId) -> TbStats {
        self.stats.lock().get(&process).copied().unwrap_or_default()
    }
}

/// Translations retired under the PFN lock but not yet flushed.
///
/// Must be flushed before the PFN lock is released, or a frame could be
/// reused while a stale translation still points at it.
pub struct PendingFlushList {
    process: ProcessId,
    capacity: usize,
    entries: Vec<VirtualPageNumber>,
    overflowed: bool,
}

impl PendingFlushList {
    #[must_use]
    pub const fn new(process: ProcessId, capacity: usize) -> Self {
        Self {
            process,
            capacity,
            entries: Vec::new(),
            overflowed: false,
        }
    }

    pub fn add(&mut self, vpn: VirtualPageNumber) {
        if self.overflowed {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.clear();
            self.overflowed = true;
        } else {
            self.entries.push(vpn);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && !self.overflowed
    }

    /// Flushes every pending entry, or the whole TB after an overflow.
    pub fn flush(&mut self, tb: &SoftTlb) {
        if self.overflowed {
            tb.flush_entire(self.process);
        } else {
            for vpn in self.entries.drain(..) {
                tb.flush_single(self.process, vpn);
            }
        }
        self.entries.clear();
        self.overflowed = false;
    }
}

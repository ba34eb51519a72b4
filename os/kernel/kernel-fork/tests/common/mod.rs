#![allow(dead_code)]

use kernel_alloc::{QuotaBlock, QuotaKind};
use kernel_fork::clone::{CloneBlock, CloneDescriptor};
use kernel_fork::{MemoryManager, MmConfig, Process, Thread, Vad, WsLockMode};
use kernel_memory_addresses::{PoolAddress, VirtualPageNumber, VirtualPageRange};
use kernel_vmem::{Protection, Pte};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::{Arc, Once};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;
static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    });
}

pub fn manager(physical_pages: usize) -> MemoryManager {
    init_logging();
    MemoryManager::new(MmConfig::default(), physical_pages, 64)
}

pub fn process(mm: &MemoryManager) -> Process {
    mm.create_process(QuotaBlock::unlimited()).unwrap()
}

pub const fn page(vpn: u64) -> VirtualPageNumber {
    VirtualPageNumber::new(vpn)
}

/// Inserts a read/write private region of `pages` pages at `start`.
pub fn private_region(
    mm: &MemoryManager,
    thread: &Thread,
    process: &Process,
    start: u64,
    pages: u64,
) -> VirtualPageRange {
    let range = VirtualPageRange::with_len(page(start), pages);
    mm.insert_vad(thread, process, Vad::private(range, Protection::READWRITE))
        .unwrap();
    range
}

/// Demand-zero faults every page of `range`.
pub fn touch(mm: &MemoryManager, thread: &Thread, process: &Process, range: VirtualPageRange) {
    for vpn in range {
        mm.resolve_demand_zero_fault(thread, process, vpn).unwrap();
    }
}

pub fn descriptors(process: &Process, thread: &Thread) -> Vec<Arc<CloneDescriptor>> {
    let ws = process.lock_working_set(thread, WsLockMode::Safe);
    ws.clone_root().map(|registry| registry.snapshot()).unwrap_or_default()
}

pub fn has_clone_root(process: &Process, thread: &Thread) -> bool {
    process.lock_working_set(thread, WsLockMode::Safe).clone_root().is_some()
}

pub fn vad_count(process: &Process, thread: &Thread) -> usize {
    process.lock_working_set(thread, WsLockMode::Safe).vads().len()
}

/// Clone block a Prototype PTE names.
pub fn clone_address(mm: &MemoryManager, process: &Process, vpn: VirtualPageNumber) -> PoolAddress {
    match mm.query_pte(process, vpn) {
        Pte::Prototype { proto } => proto,
        other => panic!("{vpn} is not a prototype PTE: {other:?}"),
    }
}

/// The descriptor of `process` covering `address`.
pub fn descriptor_of(process: &Process, thread: &Thread, address: PoolAddress) -> Arc<CloneDescriptor> {
    let ws = process.lock_working_set(thread, WsLockMode::Safe);
    let registry = ws.clone_root().expect("process has no clone registry");
    Arc::clone(registry.find_containing(address).expect("no descriptor covers the block"))
}

pub fn block_refs(descriptor: &CloneDescriptor, address: PoolAddress) -> i32 {
    block(descriptor, address).refs().get()
}

pub fn block(descriptor: &CloneDescriptor, address: PoolAddress) -> &CloneBlock {
    descriptor.block(address).expect("not a clone block")
}

/// Live count never exceeds the pending count.
pub fn assert_descriptor_counts(process: &Process, thread: &Thread) {
    for descriptor in descriptors(process, thread) {
        let refs = descriptor.refs();
        assert!(
            refs.live() <= refs.pending(),
            "descriptor at {}: live {} > pending {}",
            descriptor.start(),
            refs.live(),
            refs.pending()
        );
    }
}

/// Pool, frame and paging-file usage of the whole memory manager.
pub fn usage(mm: &MemoryManager) -> (usize, usize, usize, usize) {
    (
        mm.pfn().lock().pages_in_use(),
        mm.paged_pool().bytes_in_use(),
        mm.non_paged_pool().bytes_in_use(),
        mm.paging_file().lock().in_use(),
    )
}

pub fn assert_quota_returned(process: &Process) {
    for kind in [QuotaKind::PagedPool, QuotaKind::NonPagedPool, QuotaKind::Commit] {
        assert_eq!(process.quota().usage(kind), 0, "{kind:?} of {:?}", process.id());
    }
}

mod common;

use common::*;
use kernel_fork::{FaultError, Inherit, MemoryManager, Process, SectionKind, Thread, Vad, VadError};
use kernel_memory_addresses::VirtualPageRange;
use kernel_vmem::Protection;
use std::sync::Arc;

/// A parent with resident, trimmed and paged-out private pages and a view.
fn populated_parent(mm: &MemoryManager, thread: &Thread) -> Process {
    let parent = process(mm);
    let range = private_region(mm, thread, &parent, 0x100, 12);
    touch(mm, thread, &parent, VirtualPageRange::with_len(range.start(), 10));
    mm.trim_page(thread, &parent, page(0x102)).unwrap();
    mm.trim_page(thread, &parent, page(0x103)).unwrap();
    mm.write_page_to_paging_file(thread, &parent, page(0x103)).unwrap();
    let far = private_region(mm, thread, &parent, 0x4_0000, 2);
    touch(mm, thread, &parent, far);
    let section = mm.create_section(3, SectionKind::Data);
    mm.map_view(thread, &parent, &section, page(0x800), Inherit::Share, Protection::READWRITE, false)
        .unwrap();
    parent
}

#[test]
fn deleting_every_process_returns_all_resources() {
    let mm = manager(512);
    let thread = Thread::new();
    let baseline = usage(&mm);
    let parent = populated_parent(&mm, &thread);
    let child = process(&mm);
    let grandchild = process(&mm);
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();
    mm.copy_on_write_fault(&thread, &child, page(0x100)).unwrap();
    mm.resolve_clone_read_fault(&thread, &parent, page(0x101)).unwrap();
    mm.resolve_clone_read_fault(&thread, &child, page(0x103)).unwrap();
    mm.clone_process_address_space(&thread, &child, &grandchild).unwrap();
    mm.resolve_demand_zero_fault(&thread, &grandchild, page(0x10B)).unwrap();

    mm.delete_address_space(&thread, &child);
    assert_quota_returned(&child);
    mm.delete_address_space(&thread, &parent);
    assert_quota_returned(&parent);
    mm.delete_address_space(&thread, &grandchild);
    assert_quota_returned(&grandchild);

    assert_eq!(usage(&mm), baseline);
    for process in [&parent, &child, &grandchild] {
        assert_eq!(process.private_pages(), 0);
        assert_eq!(process.virtual_size(), 0);
        assert!(mm.tb().stats(process.id()).entire >= 1);
    }
}

#[test]
fn header_goes_with_the_last_process() {
    let mm = manager(128);
    let thread = Thread::new();
    let parent = process(&mm);
    let child = process(&mm);
    let range = private_region(&mm, &thread, &parent, 0x20, 4);
    touch(&mm, &thread, &parent, range);
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();
    let proto = clone_address(&mm, &parent, page(0x20));
    let header = Arc::clone(descriptor_of(&parent, &thread, proto).header());
    let store_bytes = header.store().bytes();
    assert_eq!(mm.paged_pool().bytes_in_use(), store_bytes);

    mm.delete_address_space(&thread, &parent);
    assert_eq!(header.process_refs().get(), 1);
    assert_eq!(mm.paged_pool().bytes_in_use(), store_bytes);
    assert_eq!(descriptors(&child, &thread).len(), 1);

    mm.delete_address_space(&thread, &child);
    assert_eq!(header.process_refs().get(), 0);
    assert_eq!(mm.paged_pool().bytes_in_use(), 0);
}

#[test]
fn deleted_address_space_refuses_further_work() {
    let mm = manager(64);
    let thread = Thread::new();
    let process = process(&mm);
    let range = private_region(&mm, &thread, &process, 0x10, 2);
    touch(&mm, &thread, &process, range);

    mm.delete_address_space(&thread, &process);
    mm.delete_address_space(&thread, &process);

    assert!(process.is_vm_deleted());
    assert_eq!(
        mm.resolve_demand_zero_fault(&thread, &process, page(0x10)),
        Err(FaultError::ProcessTerminating)
    );
    let again = VirtualPageRange::with_len(page(0x10), 1);
    assert_eq!(
        mm.insert_vad(&thread, &process, Vad::private(again, Protection::READWRITE)),
        Err(VadError::ProcessTerminating)
    );
    assert_eq!(vad_count(&process, &thread), 0);
}

#[test]
fn large_page_views_release_their_frame() {
    let mm = manager(64);
    let thread = Thread::new();
    let baseline = usage(&mm);
    let process = process(&mm);
    let section = mm.create_section(2, SectionKind::Data);
    mm.map_view(&thread, &process, &section, page(0x2_0000), Inherit::Share, Protection::READWRITE, true)
        .unwrap();
    assert_eq!(section.mapped_views(), 1);

    mm.delete_address_space(&thread, &process);

    assert_eq!(section.mapped_views(), 0);
    assert_eq!(section.writable_user_references(), 0);
    assert_eq!(usage(&mm), baseline);
}

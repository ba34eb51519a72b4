mod common;

use common::*;
use kernel_alloc::QuotaKind;
use kernel_fork::{FaultError, PendingFlushList, Thread, WsLockMode};
use kernel_vmem::{Protection, Pte};

#[test]
fn write_fault_in_child_drops_its_block_reference() {
    let mm = manager(64);
    let thread = Thread::new();
    let parent = process(&mm);
    let child = process(&mm);
    let range = private_region(&mm, &thread, &parent, 10, 1);
    touch(&mm, &thread, &parent, range);
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();
    let proto = clone_address(&mm, &parent, page(10));
    let descriptor = descriptor_of(&parent, &thread, proto);

    mm.copy_on_write_fault(&thread, &child, page(10)).unwrap();

    assert_eq!(block_refs(&descriptor, proto), 1);
    assert_eq!(descriptor.refs().live(), 1);
    assert_eq!(descriptor.header().process_refs().get(), 1);
    assert!(descriptors(&child, &thread).is_empty());
    assert_eq!(descriptors(&parent, &thread).len(), 1);
    assert_eq!(child.private_pages(), 1);
    assert_eq!(child.quota().usage(QuotaKind::PagedPool), 0);
    assert!(matches!(
        mm.query_pte(&child, page(10)),
        Pte::Valid { writable: true, protection: Protection::READWRITE, .. }
    ));
    assert_eq!(mm.query_pte(&parent, page(10)), Pte::Prototype { proto });
    assert_eq!(mm.tb().stats(child.id()).single, 1);
}

#[test]
fn descriptor_survives_while_other_ptes_reference_it() {
    let mm = manager(64);
    let thread = Thread::new();
    let parent = process(&mm);
    let child = process(&mm);
    let range = private_region(&mm, &thread, &parent, 0x20, 2);
    touch(&mm, &thread, &parent, range);
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();
    let first = clone_address(&mm, &child, page(0x20));
    let second = clone_address(&mm, &child, page(0x21));
    let in_child = descriptor_of(&child, &thread, first);
    assert_eq!(in_child.refs().live(), 2);

    mm.copy_on_write_fault(&thread, &child, page(0x20)).unwrap();

    assert_eq!(in_child.refs().live(), 1);
    assert_eq!(in_child.refs().pending(), 1);
    assert_eq!(descriptors(&child, &thread).len(), 1);
    assert_eq!(block_refs(&in_child, first), 1);
    assert_eq!(block_refs(&in_child, second), 2);
    assert_eq!(in_child.header().process_refs().get(), 2);
    assert_descriptor_counts(&child, &thread);
}

#[test]
fn last_writer_frees_the_shared_frame() {
    let mm = manager(64);
    let thread = Thread::new();
    let parent = process(&mm);
    let child = process(&mm);
    let range = private_region(&mm, &thread, &parent, 10, 1);
    touch(&mm, &thread, &parent, range);
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();
    let Pte::Prototype { proto } = mm.query_pte(&parent, page(10)) else {
        unreachable!()
    };
    let descriptor = descriptor_of(&parent, &thread, proto);
    let Pte::Valid { frame: shared, .. } = block(&descriptor, proto).saved_pte().decode() else {
        unreachable!()
    };

    mm.copy_on_write_fault(&thread, &child, page(10)).unwrap();
    assert_eq!(mm.pfn().lock().entry(shared).share_count, 1);
    let paged_before = mm.paged_pool().bytes_in_use();
    assert!(paged_before > 0);

    mm.copy_on_write_fault(&thread, &parent, page(10)).unwrap();

    assert!(descriptors(&parent, &thread).is_empty());
    assert_eq!(mm.pfn().lock().entry(shared).share_count, 0);
    assert!(mm.pfn().lock().entry(shared).backing.pte_address.is_none());
    assert_eq!(mm.paged_pool().bytes_in_use(), 0);
    assert_eq!(parent.quota().usage(QuotaKind::PagedPool), 0);
    assert_eq!(parent.quota().usage(QuotaKind::NonPagedPool), 0);
    assert_eq!(parent.private_pages(), 1);
}

#[test]
fn read_fault_maps_the_shared_frame_write_copy() {
    let mm = manager(64);
    let thread = Thread::new();
    let parent = process(&mm);
    let child = process(&mm);
    let range = private_region(&mm, &thread, &parent, 0x30, 1);
    touch(&mm, &thread, &parent, range);
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();
    let proto = clone_address(&mm, &child, page(0x30));
    let descriptor = descriptor_of(&child, &thread, proto);
    let Pte::Valid { frame, .. } = block(&descriptor, proto).saved_pte().decode() else {
        unreachable!()
    };

    mm.resolve_clone_read_fault(&thread, &child, page(0x30)).unwrap();
    mm.resolve_clone_read_fault(&thread, &parent, page(0x30)).unwrap();

    for process in [&parent, &child] {
        let Pte::Valid {
            frame: mapped,
            writable,
            copy_on_write,
            ..
        } = mm.query_pte(process, page(0x30))
        else {
            panic!("read fault must leave a valid PTE");
        };
        assert_eq!(mapped, frame);
        assert!(!writable);
        assert!(copy_on_write);
    }
    assert_eq!(mm.pfn().lock().entry(frame).share_count, 3);
    assert_eq!(block_refs(&descriptor, proto), 2);

    // trimming returns the mapping to the clone PTE
    mm.trim_page(&thread, &child, page(0x30)).unwrap();
    assert_eq!(mm.query_pte(&child, page(0x30)), Pte::Prototype { proto });
    assert_eq!(mm.pfn().lock().entry(frame).share_count, 2);
}

#[test]
fn read_fault_on_a_paged_out_block_brings_it_back() {
    let mm = manager(64);
    let thread = Thread::new();
    let parent = process(&mm);
    let child = process(&mm);
    let range = private_region(&mm, &thread, &parent, 0x40, 1);
    touch(&mm, &thread, &parent, range);
    mm.trim_page(&thread, &parent, page(0x40)).unwrap();
    mm.write_page_to_paging_file(&thread, &parent, page(0x40)).unwrap();
    assert_eq!(mm.paging_file().lock().in_use(), 1);
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();

    // nothing keeps the clone page resident now
    assert!(mm.paged_pool().trim() > 0);
    let proto = clone_address(&mm, &child, page(0x40));
    assert!(!mm.paged_pool().is_resident(proto));

    mm.resolve_clone_read_fault(&thread, &child, page(0x40)).unwrap();

    assert!(mm.paged_pool().is_resident(proto));
    let descriptor = descriptor_of(&child, &thread, proto);
    let Pte::Valid { frame, .. } = block(&descriptor, proto).saved_pte().decode() else {
        panic!("the block must hold the page again");
    };
    assert!(matches!(mm.query_pte(&child, page(0x40)), Pte::Valid { frame: mapped, .. } if mapped == frame));

    // the slot is released with the last reference to the block
    mm.delete_address_space(&thread, &child);
    assert_eq!(mm.paging_file().lock().in_use(), 1);
    mm.delete_address_space(&thread, &parent);
    assert_eq!(mm.paging_file().lock().in_use(), 0);
}

#[test]
fn read_fault_on_a_transition_block_revalidates_it() {
    let mm = manager(64);
    let thread = Thread::new();
    let parent = process(&mm);
    let child = process(&mm);
    let range = private_region(&mm, &thread, &parent, 0x50, 1);
    touch(&mm, &thread, &parent, range);
    mm.trim_page(&thread, &parent, page(0x50)).unwrap();
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();
    let proto = clone_address(&mm, &parent, page(0x50));
    let descriptor = descriptor_of(&parent, &thread, proto);
    let Pte::Transition { frame, .. } = block(&descriptor, proto).saved_pte().decode() else {
        panic!("a trimmed page must be saved in transition");
    };

    mm.resolve_clone_read_fault(&thread, &parent, page(0x50)).unwrap();

    assert!(matches!(block(&descriptor, proto).saved_pte().decode(), Pte::Valid { .. }));
    assert_eq!(mm.pfn().lock().entry(frame).share_count, 2);
}

#[test]
fn decommitting_a_clone_page_drops_the_reference() {
    let mm = manager(64);
    let thread = Thread::new();
    let parent = process(&mm);
    let child = process(&mm);
    let range = private_region(&mm, &thread, &parent, 0x60, 2);
    touch(&mm, &thread, &parent, range);
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();
    let proto = clone_address(&mm, &child, page(0x61));
    let descriptor = descriptor_of(&child, &thread, proto);

    mm.decommit_page(&thread, &child, page(0x61)).unwrap();

    assert!(mm.query_pte(&child, page(0x61)).is_decommitted());
    assert_eq!(block_refs(&descriptor, proto), 1);
    assert_eq!(descriptor.refs().live(), 1);
    assert_eq!(
        mm.resolve_demand_zero_fault(&thread, &child, page(0x61)),
        Err(FaultError::NoVad)
    );
}

#[test]
fn faults_outside_clone_pages_are_refused() {
    let mm = manager(64);
    let thread = Thread::new();
    let parent = process(&mm);
    let section = mm.create_section(1, kernel_fork::SectionKind::Data);
    mm.map_view(
        &thread,
        &parent,
        &section,
        page(0x70),
        kernel_fork::Inherit::Share,
        Protection::READONLY,
        false,
    )
    .unwrap();
    let range = private_region(&mm, &thread, &parent, 0x80, 1);
    touch(&mm, &thread, &parent, range);

    assert_eq!(
        mm.resolve_clone_read_fault(&thread, &parent, page(0x70)),
        Err(FaultError::NotClonePrototype)
    );
    assert_eq!(
        mm.copy_on_write_fault(&thread, &parent, page(0x70)),
        Err(FaultError::NotClonePrototype)
    );
    assert_eq!(
        mm.resolve_clone_read_fault(&thread, &parent, page(0x90)),
        Err(FaultError::NoVad)
    );
    // a page the process already owns stays as it is
    let before = mm.query_pte(&parent, page(0x80));
    mm.copy_on_write_fault(&thread, &parent, page(0x80)).unwrap();
    assert_eq!(mm.query_pte(&parent, page(0x80)), before);
    assert_eq!(
        mm.resolve_demand_zero_fault(&thread, &parent, page(0x70)),
        Err(FaultError::NoVad)
    );
}

#[test]
fn decrement_without_a_block_only_touches_the_descriptor() {
    let mm = manager(64);
    let thread = Thread::new();
    let parent = process(&mm);
    let child = process(&mm);
    let range = private_region(&mm, &thread, &parent, 0xA0, 3);
    touch(&mm, &thread, &parent, range);
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();
    let proto = clone_address(&mm, &parent, page(0xA0));
    let descriptor = descriptor_of(&parent, &thread, proto);

    let released = {
        let mut ws = parent.lock_working_set(&thread, WsLockMode::Safe);
        let mut pfn = mm.pfn().lock();
        let mut pending = PendingFlushList::new(parent.id(), 4);
        mm.decrement_clone_block_reference(&mut ws, &mut pfn, &descriptor, None, &mut pending)
    };

    assert!(!released);
    assert_eq!(descriptor.refs().live(), 2);
    assert_eq!(descriptor.refs().pending(), 2);
    assert_eq!(block_refs(&descriptor, proto), 2);
}

#[test]
fn pending_flushes_go_out_before_the_pfn_lock_is_dropped() {
    let mm = manager(64);
    let thread = Thread::new();
    let parent = process(&mm);
    let child = process(&mm);
    let range = private_region(&mm, &thread, &parent, 0xB0, 1);
    touch(&mm, &thread, &parent, range);
    mm.clone_process_address_space(&thread, &parent, &child).unwrap();
    let proto = clone_address(&mm, &child, page(0xB0));
    let descriptor = descriptor_of(&child, &thread, proto);
    let before = mm.tb().stats(child.id());

    let released = {
        let mut ws = child.lock_working_set(&thread, WsLockMode::Safe);
        let mut pfn = mm.pfn().lock();
        let mut pending = PendingFlushList::new(child.id(), 4);
        pending.add(page(0xB0));
        let released = mm.decrement_clone_block_reference(&mut ws, &mut pfn, &descriptor, Some(proto), &mut pending);
        assert!(pending.is_empty());
        released
    };

    assert!(released);
    assert_eq!(mm.tb().stats(child.id()).single, before.single + 1);
    assert!(descriptors(&child, &thread).is_empty());
    assert_eq!(block_refs(&descriptor, proto), 1);
}

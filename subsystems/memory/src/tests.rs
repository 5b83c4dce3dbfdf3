//! Cross-module scenario tests: whole-subsystem behavior that no single
//! module test can cover.

use crate::address_space::AddressSpace;
use crate::area::{AccessKind, AddressSpec, AreaProtection, AreaWiring, CloneMapping};
use crate::store::{MemoryVnode, StackGrowth, Vnode};
use crate::vm::{AnonymousOptions, BootArgs, Vm};
use crate::{VmError, PAGE_SIZE};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

fn boot(total_pages: u64) -> Vm {
    Vm::new(BootArgs {
        total_pages,
        ..BootArgs::default()
    })
}

fn user_space(vm: &Vm) -> Arc<AddressSpace> {
    vm.create_address_space(2).unwrap()
}

#[test]
fn test_simple_demand_zero_fault() {
    let vm = boot(64);
    let space = user_space(&vm);
    let id = vm
        .create_area(
            &space,
            "anon",
            AddressSpec::Any,
            16384,
            AreaWiring::NoLock,
            AreaProtection::USER_RW,
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();

    let committed_before = vm.commitment().used();
    vm.page_fault(&space, area.base(), AccessKind::Read, true)
        .unwrap();

    // Page allocated and cleared, mapping installed, one page committed.
    assert_eq!(area.cache().page_count(), 1);
    let mut buf = [0xffu8; 16];
    vm.read_memory(&space, area.base(), &mut buf).unwrap();
    assert_eq!(buf, [0u8; 16]);
    assert!(space.translation_map().query(area.base()).is_some());
    assert_eq!(vm.commitment().used() - committed_before, PAGE_SIZE);
    assert_eq!(space.fault_count(), 1);
    assert_eq!(area.mappings().len(), 1);
}

#[test]
fn test_stack_guard_rejects_fault() {
    let vm = boot(64);
    let space = user_space(&vm);
    // A downward-growing stack: the guard page sits at the low end.
    let id = vm
        .create_area(
            &space,
            "stack",
            AddressSpec::Any,
            65536,
            AreaWiring::NoLock,
            AreaProtection::USER_RW | AreaProtection::STACK,
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();

    let free_before = vm.page_manager().unowned_pages();
    assert_eq!(
        vm.page_fault(&space, area.base(), AccessKind::Read, true),
        Err(VmError::BadAddress)
    );

    // No page was allocated or mapped.
    assert_eq!(vm.page_manager().unowned_pages(), free_before);
    assert_eq!(area.cache().page_count(), 0);
    assert!(space.translation_map().query(area.base()).is_none());

    // The rest of the stack works.
    vm.page_fault(&space, area.base().add(PAGE_SIZE), AccessKind::Write, true)
        .unwrap();
}

#[test]
fn test_overcommit_exhaustion() {
    let vm = boot(64);
    let space = user_space(&vm);
    let id = vm
        .create_anonymous_area(
            &space,
            "big",
            AddressSpec::Any,
            4 * 1024 * 1024,
            AreaWiring::NoLock,
            AreaProtection::USER_RW | AreaProtection::OVERCOMMIT,
            AnonymousOptions {
                precommit_pages: 16,
                ..AnonymousOptions::default()
            },
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();

    // The precommit was reserved at creation time.
    assert_eq!(vm.commitment().used(), 16 * PAGE_SIZE);

    // Saturate the commit counter.
    assert!(vm.commitment().try_reserve(vm.commitment().available()));

    // The first 16 touches ride on the precommit budget.
    for page in 0..16u64 {
        vm.page_fault(
            &space,
            area.base().add(page * PAGE_SIZE),
            AccessKind::Write,
            true,
        )
        .unwrap();
    }

    // The 17th needs a fresh reservation and fails; nothing is installed.
    let address = area.base().add(16 * PAGE_SIZE);
    assert_eq!(
        vm.page_fault(&space, address, AccessKind::Write, true),
        Err(VmError::OutOfMemory)
    );
    assert!(space.translation_map().query(address).is_none());
    assert_eq!(area.cache().page_count(), 16);
}

#[test]
fn test_copy_on_write_clone() {
    let vm = boot(64);
    let space = user_space(&vm);
    let parent_id = vm
        .create_area(
            &space,
            "parent",
            AddressSpec::Any,
            8192,
            AreaWiring::NoLock,
            AreaProtection::USER_RW,
        )
        .unwrap();
    let parent = vm.area_by_id(parent_id).unwrap();
    vm.write_memory(&space, parent.base(), &[0x11]).unwrap();

    let child_id = vm
        .clone_area(
            &space,
            "child",
            AddressSpec::Any,
            AreaProtection::USER_RW,
            CloneMapping::Private,
            parent_id,
        )
        .unwrap();
    let child = vm.area_by_id(child_id).unwrap();

    // The child reads the parent's byte through the chain.
    let mut byte = [0u8; 1];
    vm.read_memory(&space, child.base(), &mut byte).unwrap();
    assert_eq!(byte[0], 0x11);

    // A child write copies up; the parent is untouched.
    vm.write_memory(&space, child.base(), &[0x22]).unwrap();
    vm.read_memory(&space, parent.base(), &mut byte).unwrap();
    assert_eq!(byte[0], 0x11);
    vm.read_memory(&space, child.base(), &mut byte).unwrap();
    assert_eq!(byte[0], 0x22);

    // The child cache owns its private copy; the original page still sits
    // in the shared source cache.
    assert!(child.cache().lookup_page(0).is_some());
    let shared_source = child.cache().source().unwrap();
    assert!(shared_source.lookup_page(0).is_some());
    assert_ne!(
        child.cache().lookup_page(0),
        shared_source.lookup_page(0)
    );

    // A later parent write copies up on its side too and stays private.
    vm.write_memory(&space, parent.base(), &[0x33]).unwrap();
    vm.read_memory(&space, child.base(), &mut byte).unwrap();
    assert_eq!(byte[0], 0x22);
}

#[test]
fn test_shared_clone_sees_writes() {
    let vm = boot(64);
    let space = user_space(&vm);
    let parent_id = vm
        .create_area(
            &space,
            "parent",
            AddressSpec::Any,
            8192,
            AreaWiring::NoLock,
            AreaProtection::USER_RW,
        )
        .unwrap();
    let parent = vm.area_by_id(parent_id).unwrap();

    let clone_id = vm
        .clone_area(
            &space,
            "twin",
            AddressSpec::Any,
            AreaProtection::USER_RW,
            CloneMapping::Shared,
            parent_id,
        )
        .unwrap();
    let clone = vm.area_by_id(clone_id).unwrap();

    vm.write_memory(&space, parent.base().add(5), &[0x77]).unwrap();
    let mut byte = [0u8; 1];
    vm.read_memory(&space, clone.base().add(5), &mut byte).unwrap();
    assert_eq!(byte[0], 0x77);
    assert!(Arc::ptr_eq(&parent.cache(), &clone.cache()));
}

#[test]
fn test_area_deletion_cleans_up() {
    let vm = boot(64);
    let space = user_space(&vm);
    let free_before = vm.page_manager().unowned_pages();
    let free_space_before = space.free_space();
    let committed_before = vm.commitment().used();

    let id = vm
        .create_area(
            &space,
            "short-lived",
            AddressSpec::Any,
            3 * PAGE_SIZE,
            AreaWiring::NoLock,
            AreaProtection::USER_RW,
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();
    let base = area.base();
    for page in 0..3u64 {
        vm.page_fault(&space, base.add(page * PAGE_SIZE), AccessKind::Write, true)
            .unwrap();
    }
    assert_eq!(vm.page_manager().unowned_pages(), free_before - 3);
    drop(area);

    vm.delete_area(id).unwrap();

    // Pages returned, mappings gone, space accounting restored,
    // translations dropped, commitment released.
    assert_eq!(vm.page_manager().unowned_pages(), free_before);
    assert!(vm.mappings.is_empty());
    assert_eq!(space.area_count(), 0);
    assert_eq!(space.free_space(), free_space_before);
    assert_eq!(space.translation_map().mapped_count(), 0);
    assert_eq!(vm.commitment().used(), committed_before);
    assert_eq!(vm.delete_area(id), Err(VmError::BadArea));
}

static DAEMON_TICKS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

fn scenario_daemon(arg: usize, _iteration: i64) {
    DAEMON_TICKS[arg].fetch_add(1, Ordering::Relaxed);
}

#[test]
fn test_daemon_scheduling_balances_offsets() {
    let vm = boot(16);
    vm.register_kernel_daemon(scenario_daemon, 0, 5).unwrap();
    vm.register_kernel_daemon(scenario_daemon, 1, 5).unwrap();

    vm.kernel_daemons().run_ticks(20);

    // Each ran exactly 4 times, on rotated iterations.
    assert_eq!(DAEMON_TICKS[0].load(Ordering::Relaxed), 4);
    assert_eq!(DAEMON_TICKS[1].load(Ordering::Relaxed), 4);

    vm.unregister_kernel_daemon(scenario_daemon, 0).unwrap();
    vm.unregister_kernel_daemon(scenario_daemon, 1).unwrap();
}

#[test]
fn test_areas_never_overlap() {
    let vm = boot(64);
    let space = user_space(&vm);
    for index in 0..4 {
        vm.create_area(
            &space,
            "piece",
            AddressSpec::Any,
            (index + 1) * 0x2000,
            AreaWiring::NoLock,
            AreaProtection::USER_RW,
        )
        .unwrap();
    }
    let areas = space.areas();
    for pair in areas.windows(2) {
        assert!(pair[0].end() <= pair[1].base());
    }
}

#[test]
fn test_fault_at_area_end_is_bad_address() {
    let vm = boot(64);
    let space = user_space(&vm);
    let id = vm
        .create_area(
            &space,
            "bounded",
            AddressSpec::Any,
            0x2000,
            AreaWiring::NoLock,
            AreaProtection::USER_RW,
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();

    // Half-open range: the last byte faults, one past it does not resolve.
    vm.page_fault(&space, area.end().sub(1), AccessKind::Read, true)
        .unwrap();
    assert_eq!(
        vm.page_fault(&space, area.end(), AccessKind::Read, true),
        Err(VmError::BadAddress)
    );
}

#[test]
fn test_protection_violation_and_idempotent_reprotect() {
    let vm = boot(64);
    let space = user_space(&vm);
    let id = vm
        .create_area(
            &space,
            "text",
            AddressSpec::Any,
            0x2000,
            AreaWiring::NoLock,
            AreaProtection::USER_RW,
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();
    vm.write_memory(&space, area.base(), &[1, 2, 3]).unwrap();

    let read_only = AreaProtection::READ | AreaProtection::KERNEL_READ;
    vm.set_area_protection(id, read_only).unwrap();
    assert_eq!(
        vm.page_fault(&space, area.base(), AccessKind::Write, true),
        Err(VmError::ProtectionViolation)
    );

    // Reprotecting with the same bits changes nothing further.
    let snapshot = space.translation_map().query(area.base());
    vm.set_area_protection(id, read_only).unwrap();
    assert_eq!(space.translation_map().query(area.base()), snapshot);

    // Reads still work, and the data survived.
    let mut buf = [0u8; 3];
    vm.read_memory(&space, area.base(), &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3]);
}

#[test]
fn test_read_then_write_fault_yields_private_zero_page() {
    let vm = boot(64);
    let space = user_space(&vm);
    let id = vm
        .create_area(
            &space,
            "fresh",
            AddressSpec::Any,
            0x2000,
            AreaWiring::NoLock,
            AreaProtection::USER_RW,
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();

    vm.page_fault(&space, area.base(), AccessKind::Read, true)
        .unwrap();
    vm.write_memory(&space, area.base().add(8), &[0xee]).unwrap();

    // One cache-local page: zeros except the written byte.
    assert_eq!(area.cache().page_count(), 1);
    let mut buf = [0u8; 16];
    vm.read_memory(&space, area.base(), &mut buf).unwrap();
    let mut expected = [0u8; 16];
    expected[8] = 0xee;
    assert_eq!(buf, expected);
}

#[test]
fn test_upward_guard_sits_at_high_end() {
    let vm = boot(64);
    let space = user_space(&vm);
    let id = vm
        .create_anonymous_area(
            &space,
            "upstack",
            AddressSpec::Any,
            16 * PAGE_SIZE,
            AreaWiring::NoLock,
            AreaProtection::USER_RW | AreaProtection::OVERCOMMIT,
            AnonymousOptions {
                guard_pages: 1,
                growth: StackGrowth::Upward,
                ..AnonymousOptions::default()
            },
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();

    vm.page_fault(&space, area.base(), AccessKind::Read, true)
        .unwrap();
    assert_eq!(
        vm.page_fault(&space, area.end().sub(PAGE_SIZE), AccessKind::Read, true),
        Err(VmError::BadAddress)
    );
}

#[test]
fn test_resize_shrink_unmaps_truncated_range() {
    let vm = boot(64);
    let space = user_space(&vm);
    let id = vm
        .create_area(
            &space,
            "elastic",
            AddressSpec::Any,
            4 * PAGE_SIZE,
            AreaWiring::NoLock,
            AreaProtection::USER_RW,
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();
    for page in 0..4u64 {
        vm.write_memory(&space, area.base().add(page * PAGE_SIZE), &[page as u8])
            .unwrap();
    }
    let free_after_faults = vm.page_manager().unowned_pages();

    vm.resize_area(id, 2 * PAGE_SIZE).unwrap();
    assert_eq!(area.size(), 2 * PAGE_SIZE);
    assert!(space
        .translation_map()
        .query(area.base().add(3 * PAGE_SIZE))
        .is_none());
    assert_eq!(vm.page_manager().unowned_pages(), free_after_faults + 2);
    assert_eq!(area.cache().page_count(), 2);

    // Growing back re-extends the window; the old contents are gone.
    vm.resize_area(id, 3 * PAGE_SIZE).unwrap();
    let mut byte = [0xffu8; 1];
    vm.read_memory(&space, area.base().add(2 * PAGE_SIZE), &mut byte)
        .unwrap();
    assert_eq!(byte[0], 0);
}

#[test]
fn test_committed_sum_never_exceeds_counter() {
    let vm = boot(64);
    let space = user_space(&vm);
    let mut ids = alloc::vec::Vec::new();
    for index in 0..3u64 {
        let id = vm
            .create_area(
                &space,
                "chunk",
                AddressSpec::Any,
                0x2000,
                AreaWiring::NoLock,
                AreaProtection::USER_RW,
            )
            .unwrap();
        let area = vm.area_by_id(id).unwrap();
        vm.write_memory(&space, area.base().add(index), &[1]).unwrap();
        ids.push(id);
    }

    let sum: u64 = ids
        .iter()
        .map(|&id| vm.area_by_id(id).unwrap().cache().committed_size())
        .sum();
    assert!(sum <= vm.commitment().used());
}

#[test]
fn test_page_scanner_demotes_writes_back_and_reclaims() {
    let vm = boot(16);
    let space = user_space(&vm);
    let vnode = Arc::new(MemoryVnode::new(&[0u8; 0x2000]));
    let id = vm
        .create_vnode_area(
            &space,
            "file",
            AddressSpec::Any,
            0x2000,
            AreaProtection::USER_RW,
            vnode.clone(),
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();
    vm.write_memory(&space, area.base(), &[0xabu8; 4]).unwrap();
    assert_eq!(vm.stats().modified_pages, 1);

    // Two passes: usage decays to zero, the dirty page is written back.
    vm.page_daemon_pass();
    vm.page_daemon_pass();
    assert_eq!(vm.stats().modified_pages, 0);
    let mut buf = [0u8; 4];
    vnode.read_at(0, &mut buf, false).unwrap();
    assert_eq!(buf, [0xabu8; 4]);

    // Soak up free pages until the scanner is under pressure, then let it
    // reclaim the clean inactive page.
    let hold = vm
        .page_manager()
        .allocate_contiguous(vm.page_manager().unowned_pages() as usize - 2, false)
        .unwrap();
    vm.page_daemon_pass();
    assert_eq!(area.cache().page_count(), 0);
    assert!(space.translation_map().query(area.base()).is_none());

    // A later read faults the page back in from the vnode.
    vm.read_memory(&space, area.base(), &mut buf).unwrap();
    assert_eq!(buf, [0xabu8; 4]);
    drop(hold);
}

#[test]
fn test_lazy_wiring_pins_faulted_pages() {
    let vm = boot(32);
    let space = user_space(&vm);
    let id = vm
        .create_area(
            &space,
            "lazy",
            AddressSpec::Any,
            0x2000,
            AreaWiring::Lazy,
            AreaProtection::USER_RW,
        )
        .unwrap();
    let area = vm.area_by_id(id).unwrap();

    vm.page_fault(&space, area.base(), AccessKind::Read, true)
        .unwrap();
    assert_eq!(vm.stats().wired_pages, 1);

    // The write fault re-maps the same page without double-wiring.
    vm.page_fault(&space, area.base(), AccessKind::Write, true)
        .unwrap();
    assert_eq!(vm.stats().wired_pages, 1);

    vm.delete_area(id).unwrap();
    assert_eq!(vm.stats().wired_pages, 0);
    assert_eq!(vm.page_manager().unowned_pages(), 32);
}

#[test]
fn test_cache_merges_after_clone_side_drops() {
    let vm = boot(64);
    let space = user_space(&vm);
    let parent_id = vm
        .create_area(
            &space,
            "parent",
            AddressSpec::Any,
            8192,
            AreaWiring::NoLock,
            AreaProtection::USER_RW,
        )
        .unwrap();
    let parent = vm.area_by_id(parent_id).unwrap();
    vm.write_memory(&space, parent.base(), &[0x44]).unwrap();
    let original_cache = parent.cache();

    let child_id = vm
        .clone_area(
            &space,
            "child",
            AddressSpec::Any,
            AreaProtection::USER_RW,
            CloneMapping::Private,
            parent_id,
        )
        .unwrap();

    // The chain now has two consumers in front of the original cache.
    assert_eq!(original_cache.consumer_count(), 2);
    assert!(parent.cache().source().is_some());

    // Deleting the clone leaves one consumer, so the original merges into
    // the parent's fresh cache and the chain collapses.
    vm.delete_area(child_id).unwrap();
    assert!(parent.cache().source().is_none());

    // The parent still sees its byte, now through the merged cache.
    let mut byte = [0u8; 1];
    vm.read_memory(&space, parent.base(), &mut byte).unwrap();
    assert_eq!(byte[0], 0x44);
}

use pretty_assertions::assert_eq;

use ptwalk::{walk_to_leaf, PagingMode};

use super::helpers::{attached_vm, cache_with, phys_hashing_to, sim_host};
use crate::error::CacheError;
use crate::host::HostOps;
use crate::vm::Vm;

#[test]
fn software_virtualised_vm_never_uses_the_cache() {
    let host = sim_host(PagingMode::Long64, 1);
    let cache = cache_with(&host, 8, 2048);

    let mut vm = Vm::new(1, false);
    assert!(!cache.attach_vm(&mut vm).unwrap());
    assert!(!vm.uses_cache());
    assert_eq!(cache.stats().pages, 0);
    assert_eq!(cache.stats().users, 0);

    cache.start_auto_set(&mut vm, 0).unwrap();
    assert_eq!(
        cache.map_phys(&mut vm, 0, 0x1000),
        Err(CacheError::AccessDenied)
    );

    // Detaching a non-user is a no-op.
    cache.detach_vm(&mut vm);
    assert_eq!(cache.stats().users, 0);
}

#[test]
fn detach_drains_leaked_references_and_tears_down() {
    let host = sim_host(PagingMode::Long64, 1);
    let cache = cache_with(&host, 8, 2048);
    let mut vm = attached_vm(&cache, 2);
    cache.start_auto_set(&mut vm, 0).unwrap();
    cache.start_auto_set(&mut vm, 1).unwrap();

    cache.map_phys(&mut vm, 0, 0x1000).unwrap();
    cache.map_phys(&mut vm, 0, 0x2000).unwrap();
    cache.map_phys(&mut vm, 1, 0x2000).unwrap();
    assert_eq!(cache.stats().load, 2);

    // The sets are still open: detach reports the leaks, drains them and,
    // as the last user, tears the cache down.
    cache.detach_vm(&mut vm);
    let stats = cache.stats();
    assert_eq!(stats.users, 0);
    assert_eq!(stats.pages, 0);
    assert_eq!(stats.load, 0);
    assert_eq!(host.outstanding_memobjs(), 0);
    assert!(!vm.uses_cache());
}

#[test]
fn teardown_restores_every_original_pte() {
    let host = sim_host(PagingMode::Pae, 1);
    let cache = cache_with(&host, 8, 2048);
    let mut vm = attached_vm(&cache, 1);

    let originals: Vec<(u64, u64)> = (0..cache.stats().pages)
        .map(|slot| {
            let snap = cache.slot_snapshot(slot).unwrap();
            (snap.virt, snap.pte)
        })
        .collect();

    cache.start_auto_set(&mut vm, 0).unwrap();
    for n in 0..6 {
        cache.map_phys(&mut vm, 0, 0x10_0000 + n * 0x1000).unwrap();
    }
    cache.release_auto_set(&mut vm, 0).unwrap();
    cache.detach_vm(&mut vm);

    let mode = host.paging_mode();
    let (cr3, cr4) = (host.read_cr3(), host.read_cr4());
    for (virt, original) in originals {
        let walk = walk_to_leaf(host.as_ref(), mode, cr3, cr4, virt).unwrap();
        assert_eq!(walk.pte.read(host.as_ref()), original);
    }
}

#[test]
fn teardown_broadcast_failure_falls_back_to_local_invalidation() {
    let host = sim_host(PagingMode::Long64, 2);
    let cache = cache_with(&host, 4, 2048);
    let mut vm = attached_vm(&cache, 1);
    let virts: Vec<u64> = (0..cache.stats().pages)
        .map(|slot| cache.slot_snapshot(slot).unwrap().virt)
        .collect();

    cache.start_auto_set(&mut vm, 0).unwrap();
    cache.map_phys(&mut vm, 0, 0x4000).unwrap();
    cache.release_auto_set(&mut vm, 0).unwrap();

    host.clear_invalidations();
    host.set_fail_broadcast(true);
    cache.detach_vm(&mut vm);

    // Every slot was still invalidated on the CPU we are on.
    let local = host.invalidations(0);
    for virt in &virts {
        assert!(local.contains(virt));
    }
    assert_eq!(host.invalidations(1), Vec::<u64>::new());
}

#[test]
fn migration_flushes_each_referenced_slot_once() {
    let host = sim_host(PagingMode::Long64, 2);
    let cache = cache_with(&host, 8, 2048);
    let mut vm = attached_vm(&cache, 1);
    cache.start_auto_set(&mut vm, 0).unwrap();

    let mapped = cache.map_phys(&mut vm, 0, 0x5000).unwrap();
    assert_eq!(host.invalidations(0), vec![mapped.virt]);
    assert_eq!(cache.slot_snapshot(mapped.slot).unwrap().pending, 0b10);

    // The vCPU moves to CPU 1; migration clears its pending bit with
    // exactly one flush.
    host.set_current_cpu(1);
    cache.migrate_auto_set(&vm, 0).unwrap();
    assert_eq!(host.invalidations(1), vec![mapped.virt]);
    assert_eq!(cache.slot_snapshot(mapped.slot).unwrap().pending, 0);

    // Already coherent: nothing further to flush.
    cache.migrate_auto_set(&vm, 0).unwrap();
    assert_eq!(host.invalidations(1), vec![mapped.virt]);

    cache.release_auto_set(&mut vm, 0).unwrap();
    cache.detach_vm(&mut vm);
}

#[test]
fn peak_load_survives_teardown_and_sizes_the_next_setup() {
    let host = sim_host(PagingMode::Long64, 1);
    let cache = cache_with(&host, 8, 2048);
    let mut vm = attached_vm(&cache, 1);
    assert_eq!(cache.stats().pages, 8);

    cache.start_auto_set(&mut vm, 0).unwrap();
    for slot in 0..5 {
        cache
            .map_phys(&mut vm, 0, phys_hashing_to(slot, 0, 8))
            .unwrap();
    }
    cache.release_auto_set(&mut vm, 0).unwrap();
    cache.detach_vm(&mut vm);

    let stats = cache.stats();
    assert_eq!(stats.pages, 0);
    assert_eq!(stats.max_load, 5);

    // 8 slots would sit at the overload threshold for the observed peak;
    // the new segment is sized past it.
    let mut vm = attached_vm(&cache, 1);
    assert_eq!(cache.stats().pages, 16);
    cache.detach_vm(&mut vm);
}

#[test]
fn growth_on_attach_keeps_old_indices_valid() {
    let host = sim_host(PagingMode::Long64, 2);
    let cache = cache_with(&host, 4, 2048);
    let mut vm1 = attached_vm(&cache, 1);
    assert_eq!(cache.stats().pages, 8);

    cache.start_auto_set(&mut vm1, 0).unwrap();
    let mut mapped = Vec::new();
    for slot in 0..5 {
        mapped.push((
            phys_hashing_to(slot, 0, 8),
            cache
                .map_phys(&mut vm1, 0, phys_hashing_to(slot, 0, 8))
                .unwrap(),
        ));
    }
    assert_eq!(cache.stats().max_load, 5);

    // Second user: the peak crossed half the cache, so attach grows it.
    let mut vm2 = attached_vm(&cache, 1);
    assert_eq!(cache.stats().pages, 12);
    assert_eq!(cache.segment_of(0), Some((0, 8)));
    assert_eq!(cache.segment_of(8), Some((8, 4)));
    assert_eq!(cache.segment_of(12), None);

    // Slots taken before the growth are untouched.
    for (phys, page) in &mapped {
        let snap = cache.slot_snapshot(page.slot).unwrap();
        assert_eq!(snap.host_phys, Some(*phys));
        assert_eq!(snap.virt, page.virt);
        assert_eq!(snap.refs, 1);
    }

    cache.release_auto_set(&mut vm1, 0).unwrap();
    cache.detach_vm(&mut vm2);
    assert_eq!(cache.stats().pages, 12);
    cache.detach_vm(&mut vm1);
    assert_eq!(cache.stats().pages, 0);
}

#[test]
fn vcpu_index_out_of_range_is_reported() {
    let host = sim_host(PagingMode::Long64, 1);
    let cache = cache_with(&host, 8, 2048);
    let mut vm = attached_vm(&cache, 1);

    assert!(matches!(
        cache.start_auto_set(&mut vm, 3),
        Err(CacheError::Internal(_))
    ));
    cache.detach_vm(&mut vm);
}

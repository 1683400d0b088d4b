use std::sync::atomic::{AtomicI32, AtomicU64};
use std::sync::Arc;

use ptwalk::{PagingMode, PteRef};

use crate::cache::{CacheConfig, MappingCache, Slot, INVALID_PHYS};
use crate::cpuset::CpuSet;
use crate::sim::{SimConfig, SimHost};
use crate::vm::Vm;

pub fn sim_host(mode: PagingMode, cpus: u32) -> Arc<SimHost> {
    sim_host_with_flags(mode, cpus, 0)
}

pub fn sim_host_with_flags(mode: PagingMode, cpus: u32, leaf_extra_flags: u64) -> Arc<SimHost> {
    Arc::new(
        SimHost::new(SimConfig {
            mode,
            cpus,
            leaf_extra_flags,
            ..SimConfig::default()
        })
        .unwrap(),
    )
}

pub fn cache_with(
    host: &Arc<SimHost>,
    pages_per_cpu: u32,
    max_pages: u32,
) -> Arc<MappingCache<SimHost>> {
    MappingCache::new(
        Arc::clone(host),
        CacheConfig {
            pages_per_cpu,
            max_pages,
        },
    )
    .unwrap()
}

pub fn attached_vm(cache: &MappingCache<SimHost>, vcpus: usize) -> Vm {
    let mut vm = Vm::new(vcpus, true);
    assert!(cache.attach_vm(&mut vm).unwrap());
    vm
}

/// Physical address of the `n`th distinct page hashing to `slot` in a cache
/// of `pages` slots.
pub fn phys_hashing_to(slot: u32, n: u32, pages: u32) -> u64 {
    (u64::from(slot) + u64::from(n) * u64::from(pages)) << 12
}

/// A detached slot for auto-set unit tests; nothing behind the PTE ref.
pub fn dummy_slot(index: u16) -> Arc<Slot> {
    Arc::new(Slot {
        host_phys: AtomicU64::new(INVALID_PHYS),
        virt: 0x1_0000 + u64::from(index) * 0x1000,
        pte: PteRef::Wide(0x100 + u64::from(index) * 8),
        refs: AtomicI32::new(0),
        pending: CpuSet::full(1),
    })
}

//! Entry-width dispatch across every supported host paging mode.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use dynmap::{CacheConfig, HostOps, MappingCache, SimConfig, SimHost, Vm};
use ptwalk::{
    walk_to_leaf, PagingMode, PTE_A, PTE_D, PTE_P, PTE_PG_MASK_LEGACY, PTE_PG_MASK_WIDE, PTE_RW,
};

const MODES: &[PagingMode] = &[
    PagingMode::Legacy32,
    PagingMode::Legacy32Global,
    PagingMode::Pae,
    PagingMode::PaeGlobal,
    PagingMode::PaeNx,
    PagingMode::PaeGlobalNx,
    PagingMode::Long64,
    PagingMode::Long64Global,
    PagingMode::Long64Nx,
    PagingMode::Long64GlobalNx,
];

#[test]
fn every_mode_maps_with_the_right_entry_width() {
    for &mode in MODES {
        let host = Arc::new(
            SimHost::new(SimConfig {
                mode,
                cpus: 1,
                ..SimConfig::default()
            })
            .unwrap(),
        );
        let cache = MappingCache::new(
            Arc::clone(&host),
            CacheConfig {
                pages_per_cpu: 8,
                max_pages: 2048,
            },
        )
        .unwrap();
        assert_eq!(cache.paging_mode(), mode);

        let mut vm = Vm::new(1, true);
        assert!(cache.attach_vm(&mut vm).unwrap(), "{mode:?}");
        cache.start_auto_set(&mut vm, 0).unwrap();

        let phys = 0x0070_0000u64;
        let mapped = cache.map_phys(&mut vm, 0, phys).unwrap();
        let snap = cache.slot_snapshot(mapped.slot).unwrap();

        let mask = if mode.is_legacy() {
            PTE_PG_MASK_LEGACY
        } else {
            PTE_PG_MASK_WIDE
        };
        assert_eq!(snap.pte & mask, phys, "{mode:?}");
        assert_eq!(
            snap.pte & (PTE_P | PTE_RW | PTE_A | PTE_D),
            PTE_P | PTE_RW | PTE_A | PTE_D,
            "{mode:?}"
        );

        // The live walk agrees on both the width and the value.
        let walk = walk_to_leaf(
            host.as_ref(),
            mode,
            host.read_cr3(),
            host.read_cr4(),
            mapped.virt,
        )
        .unwrap();
        assert_eq!(walk.pte.is_legacy(), mode.is_legacy(), "{mode:?}");
        assert_eq!(walk.pte.read(host.as_ref()), snap.pte, "{mode:?}");

        cache.release_auto_set(&mut vm, 0).unwrap();
        cache.detach_vm(&mut vm);
        assert_eq!(host.outstanding_memobjs(), 0, "{mode:?}");
    }
}

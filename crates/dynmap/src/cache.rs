//! The mapping cache: a reserved kernel-virtual range whose leaf PTEs are
//! multiplexed across the host-physical pages vCPUs ask for.
//!
//! Slot selection, load accounting and PTE retargeting run under a single
//! mapping lock held for the duration of a probe; reference counts and
//! per-slot pending bitsets are atomics so auto-set migration never takes
//! the lock. Setup, growth and teardown run under a separate init lock and
//! are the only places where blocking is allowed.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use ptwalk::{
    PagingMode, PteRef, PAGE_OFFSET_MASK, PAGE_SHIFT, PTE_A, PTE_D, PTE_G, PTE_P, PTE_PAT,
    PTE_PCD, PTE_PG_MASK_LEGACY, PTE_PG_MASK_WIDE, PTE_PWT, PTE_RW,
};

use crate::autoset::AutoSet;
use crate::cpuset::{CpuSet, MAX_CPUS};
use crate::error::CacheError;
use crate::host::HostOps;
use crate::segment::{build_segment, Segment};
use crate::vm::Vm;

/// Sentinel for a slot with no page installed.
pub(crate) const INVALID_PHYS: u64 = u64::MAX;

/// Leaf flag bits preserved when a slot is retargeted: cacheability and the
/// global bit belong to the virtual range, not to the page installed in it.
const PTE_PRESERVE_MASK: u64 = PTE_G | PTE_PAT | PTE_PCD | PTE_PWT;

/// Slots inspected around the hashed index before the full linear probe.
const HASH_PROBE_LEN: u32 = 5;

/// How many full-cache / full-set conditions are logged before the warnings
/// go quiet.
const FULL_WARN_LIMIT: u32 = 10;

const CACHE_MAGIC: u32 = 0x434d_5044;

/// Sizing knobs. The defaults match a cache that serves a handful of shadow
/// page tables per vCPU.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Slots reserved per online CPU when sizing a new segment.
    pub pages_per_cpu: u32,
    /// Hard cap on the total slot count.
    pub max_pages: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pages_per_cpu: 64,
            max_pages: 2048,
        }
    }
}

/// One reusable mapping window: a fixed kernel-virtual page, the leaf PTE
/// backing it, and the bookkeeping to multiplex it.
#[derive(Debug)]
pub struct Slot {
    /// Page currently installed, or [`INVALID_PHYS`]. Written only under the
    /// mapping lock.
    pub(crate) host_phys: AtomicU64,
    pub(crate) virt: u64,
    pub(crate) pte: PteRef,
    /// Outstanding references. A slot with `refs == 0` is reclaimable.
    pub(crate) refs: AtomicI32,
    /// CPUs that have not flushed this window since it was last retargeted.
    pub(crate) pending: CpuSet,
}

impl Slot {
    /// Kernel-virtual address of this window. Never changes.
    pub fn virt(&self) -> u64 {
        self.virt
    }
}

/// A successful mapping: the slot index and the usable kernel-virtual
/// address. Valid until the reference is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPage {
    pub slot: u32,
    pub virt: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub pages: u32,
    pub load: u32,
    pub max_load: u32,
    pub users: u32,
}

/// Point-in-time view of one slot, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub host_phys: Option<u64>,
    pub virt: u64,
    pub refs: i32,
    pub pending: u64,
    /// Current live value of the leaf PTE.
    pub pte: u64,
}

struct MapState {
    slots: Vec<Arc<Slot>>,
    /// Original PTE value per slot, restored at teardown.
    saved_ptes: Vec<u64>,
    /// Number of slots with outstanding references.
    load: u32,
    /// Peak load; survives teardown to size the next setup.
    max_load: u32,
}

struct InitState {
    users: u32,
    segments: Vec<Segment>,
}

/// The cache instance. Created once at module load, shared behind an `Arc`;
/// segments come and go with the first attach and last detach so a dormant
/// module holds no memory.
pub struct MappingCache<H: HostOps> {
    magic: u32,
    host: Arc<H>,
    mode: PagingMode,
    /// Whether leaf PTEs are the 4-byte legacy format.
    legacy: bool,
    config: CacheConfig,
    state: Mutex<MapState>,
    init: Mutex<InitState>,
    full_warnings: AtomicU32,
    set_full_warnings: AtomicU32,
}

impl<H: HostOps> MappingCache<H> {
    /// Creates the cache instance. No segments are allocated until the first
    /// VM attaches.
    pub fn new(host: Arc<H>, config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        if config.pages_per_cpu == 0 || config.max_pages == 0 {
            return Err(CacheError::Internal("cache sized to zero pages"));
        }
        let cpus = host.cpu_count();
        if cpus == 0 || cpus > MAX_CPUS {
            return Err(CacheError::Internal("unsupported online CPU count"));
        }
        let mode = host.paging_mode();
        Ok(Arc::new(Self {
            magic: CACHE_MAGIC,
            legacy: mode.is_legacy(),
            mode,
            host,
            config,
            state: Mutex::new(MapState {
                slots: Vec::new(),
                saved_ptes: Vec::new(),
                load: 0,
                max_load: 0,
            }),
            init: Mutex::new(InitState {
                users: 0,
                segments: Vec::new(),
            }),
            full_warnings: AtomicU32::new(0),
            set_full_warnings: AtomicU32::new(0),
        }))
    }

    pub fn paging_mode(&self) -> PagingMode {
        self.mode
    }

    pub fn stats(&self) -> CacheStats {
        let users = self.init.lock().unwrap().users;
        let state = self.state.lock().unwrap();
        CacheStats {
            pages: state.slots.len() as u32,
            load: state.load,
            max_load: state.max_load,
            users,
        }
    }

    pub fn slot_snapshot(&self, slot: u32) -> Option<SlotSnapshot> {
        let state = self.state.lock().unwrap();
        let s = state.slots.get(slot as usize)?;
        let host_phys = s.host_phys.load(Ordering::Relaxed);
        Some(SlotSnapshot {
            host_phys: (host_phys != INVALID_PHYS).then_some(host_phys),
            virt: s.virt,
            refs: s.refs.load(Ordering::Acquire),
            pending: s.pending.raw(),
            pte: s.pte.read(&*self.host),
        })
    }

    /// First slot index and length of the segment owning `slot`.
    pub fn segment_of(&self, slot: u32) -> Option<(u32, u32)> {
        let init = self.init.lock().unwrap();
        Segment::find(&init.segments, slot).map(|s| (s.first_slot, s.pages))
    }

    /// Registers a VM as a cache user.
    ///
    /// Every vCPU auto-set is reset to closed. Returns `Ok(false)` without
    /// touching the cache when the VM does not run hardware-assisted; such a
    /// VM never maps through the cache. The first user triggers setup, later
    /// users trigger growth when the observed peak load crossed the overload
    /// threshold.
    pub fn attach_vm(&self, vm: &mut Vm) -> Result<bool, CacheError> {
        debug_assert_eq!(self.magic, CACHE_MAGIC);
        vm.reset_sets();
        if !vm.hw_accel() {
            vm.set_uses_cache(false);
            return Ok(false);
        }

        let mut init = self.init.lock().unwrap();
        init.users += 1;
        let result = if init.users == 1 {
            self.setup(&mut init)
        } else {
            self.grow_if_loaded(&mut init)
        };
        if let Err(err) = result {
            init.users -= 1;
            return Err(err);
        }
        vm.set_uses_cache(true);
        Ok(true)
    }

    /// Unregisters a VM. Open auto-sets are drained — those references leaked
    /// across a guest exit and are reported. The last user tears the cache
    /// down.
    pub fn detach_vm(&self, vm: &mut Vm) {
        debug_assert_eq!(self.magic, CACHE_MAGIC);
        if !vm.uses_cache() {
            return;
        }

        let mut init = self.init.lock().unwrap();
        vm.set_uses_cache(false);

        for (vcpu, set) in vm.sets_mut().enumerate() {
            if !set.is_open() {
                continue;
            }
            let Ok(entries) = set.close() else { continue };
            if entries.is_empty() {
                continue;
            }
            let mut state = self.state.lock().unwrap();
            for entry in &entries {
                warn!(
                    vcpu,
                    slot = entry.index,
                    refs = entry.refs,
                    "releasing dangling auto-set reference at VM detach"
                );
                Self::release_page_locked(&mut state, &entry.slot, u32::from(entry.refs));
            }
        }

        debug_assert!(init.users > 0);
        init.users = init.users.saturating_sub(1);
        if init.users == 0 {
            self.teardown(&mut init);
        }
    }

    /// Opens the vCPU's auto-set for a new guest entry.
    pub fn start_auto_set(&self, vm: &mut Vm, vcpu: usize) -> Result<(), CacheError> {
        let set = vm
            .set_mut(vcpu)
            .ok_or(CacheError::Internal("vCPU index out of range"))?;
        set.open()
    }

    /// Closes the vCPU's auto-set and drops every batched reference in one
    /// pass under the mapping lock.
    pub fn release_auto_set(&self, vm: &mut Vm, vcpu: usize) -> Result<(), CacheError> {
        let set = vm
            .set_mut(vcpu)
            .ok_or(CacheError::Internal("vCPU index out of range"))?;
        let entries = set.close()?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();
        for entry in &entries {
            Self::release_page_locked(&mut state, &entry.slot, u32::from(entry.refs));
        }
        debug_assert!(state.load <= state.slots.len() as u32);
        Ok(())
    }

    /// Re-establishes TLB coherency for the current CPU on every slot in the
    /// vCPU's open set. Called when the vCPU may have moved to another
    /// physical CPU between guest entries; if it did not, every pending bit
    /// is already clear and this is a no-op.
    pub fn migrate_auto_set(&self, vm: &Vm, vcpu: usize) -> Result<(), CacheError> {
        let set = vm
            .set(vcpu)
            .ok_or(CacheError::Internal("vCPU index out of range"))?;
        if !set.is_open() {
            return Err(CacheError::WrongOrder("migrate on a closed auto-set"));
        }
        set.migrate(&*self.host);
        Ok(())
    }

    /// Maps `host_phys` into a slot and records the reference in the vCPU's
    /// open auto-set. The returned address is usable on the current CPU
    /// until the reference is released.
    pub fn map_phys(
        &self,
        vm: &mut Vm,
        vcpu: usize,
        host_phys: u64,
    ) -> Result<MappedPage, CacheError> {
        debug_assert_eq!(self.magic, CACHE_MAGIC);
        debug_assert_eq!(
            host_phys & PAGE_OFFSET_MASK,
            0,
            "host_phys must be page aligned"
        );
        if !vm.uses_cache() {
            return Err(CacheError::AccessDenied);
        }
        let set = vm
            .set_mut(vcpu)
            .ok_or(CacheError::Internal("vCPU index out of range"))?;
        self.map_into_set(set, host_phys)
    }

    pub(crate) fn map_into_set(
        &self,
        set: &mut AutoSet,
        host_phys: u64,
    ) -> Result<MappedPage, CacheError> {
        if !set.is_open() {
            return Err(CacheError::WrongOrder("map_phys on a closed auto-set"));
        }

        let (index, slot, virt) = self.map_page(host_phys)?;
        if let Err(slot) = set.append(index as u16, slot) {
            self.release_page(&slot, 1);
            if self.set_full_warnings.fetch_add(1, Ordering::Relaxed) < FULL_WARN_LIMIT {
                warn!(slot = index, "auto-set is full even after folding duplicates");
            }
            return Err(CacheError::FullSet);
        }
        Ok(MappedPage { slot: index, virt })
    }

    /// Hot path: find or claim a slot for `host_phys` and take a reference.
    fn map_page(&self, host_phys: u64) -> Result<(u32, Arc<Slot>, u64), CacheError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let pages = state.slots.len() as u32;
        if pages == 0 {
            return Err(CacheError::Internal("mapping cache has no segments"));
        }

        let hashed = ((host_phys >> PAGE_SHIFT) % u64::from(pages)) as u32;

        // Optimise for a hit on the hashed slot or its linear neighbours;
        // everything else is the slow path's business.
        let mut found = None;
        for k in 0..HASH_PROBE_LEN.min(pages) {
            let i = (hashed + k) % pages;
            if state.slots[i as usize].host_phys.load(Ordering::Relaxed) == host_phys {
                found = Some(i);
                break;
            }
        }
        let index = match found {
            Some(i) => i,
            None => match self.map_page_slow(state, host_phys, hashed) {
                Some(i) => i,
                None => {
                    if self.full_warnings.fetch_add(1, Ordering::Relaxed) < FULL_WARN_LIMIT {
                        warn!(
                            load = state.load,
                            max_load = state.max_load,
                            pages,
                            "mapping cache is full"
                        );
                    }
                    return Err(CacheError::Full {
                        load: state.load,
                        pages,
                    });
                }
            },
        };

        let slot = Arc::clone(&state.slots[index as usize]);
        let previous = slot.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous >= 0, "slot reference count went negative");
        if previous == 0 {
            state.load += 1;
            if state.load > state.max_load {
                state.max_load = state.load;
            }
            debug_assert!(state.load <= pages);
        }

        let cpu = self.host.current_cpu();
        let invalidate = slot.pending.test_and_clear(cpu);
        let virt = slot.virt;
        drop(guard);

        // The flush itself happens outside the lock; only this CPU's stale
        // translation is at stake.
        if invalidate {
            self.host.invalidate_page(virt);
        }

        Ok((index, slot, virt))
    }

    /// Selects — and if necessary retargets — a slot for `host_phys` once
    /// the fast probe found no installed match.
    fn map_page_slow(&self, state: &mut MapState, host_phys: u64, hashed: u32) -> Option<u32> {
        let pages = state.slots.len() as u32;

        // First unreferenced slot among the hashed candidates.
        let mut victim = None;
        for k in 0..HASH_PROBE_LEN.min(pages) {
            let i = (hashed + k) % pages;
            if state.slots[i as usize].refs.load(Ordering::Acquire) == 0 {
                victim = Some(i);
                break;
            }
        }

        let index = if let Some(i) = victim {
            i
        } else {
            // Bounded linear probe over the rest of the cache, preferring a
            // match over an eviction.
            let mut i = (hashed + HASH_PROBE_LEN) % pages;
            loop {
                if i == hashed {
                    return None;
                }
                let slot = &state.slots[i as usize];
                if slot.host_phys.load(Ordering::Relaxed) == host_phys {
                    return Some(i);
                }
                if slot.refs.load(Ordering::Acquire) == 0 {
                    break i;
                }
                i = (i + 1) % pages;
            }
        };

        let slot = &state.slots[index as usize];
        if slot.host_phys.load(Ordering::Relaxed) != host_phys {
            slot.host_phys.store(host_phys, Ordering::Relaxed);
            // Every CPU has to flush before it may use this window again.
            slot.pending.fill(self.host.cpu_count());

            let phys_mask = if self.legacy {
                PTE_PG_MASK_LEGACY
            } else {
                PTE_PG_MASK_WIDE
            };
            let page_bits = host_phys & phys_mask;
            slot.pte.update(&*self.host, |old| {
                (old & PTE_PRESERVE_MASK) | PTE_P | PTE_RW | PTE_A | PTE_D | page_bits
            });
        }
        Some(index)
    }

    fn release_page_locked(state: &mut MapState, slot: &Slot, refs: u32) {
        let remaining = slot.refs.fetch_sub(refs as i32, Ordering::AcqRel) - refs as i32;
        debug_assert!(remaining >= 0, "released more references than taken");
        if remaining == 0 {
            debug_assert!(state.load > 0);
            state.load -= 1;
        }
    }

    /// Release variant for callers not holding the mapping lock.
    pub(crate) fn release_page(&self, slot: &Slot, refs: u32) {
        let mut state = self.state.lock().unwrap();
        Self::release_page_locked(&mut state, slot, refs);
    }

    fn setup(&self, init: &mut InitState) -> Result<(), CacheError> {
        let pages = self.target_size();
        debug_assert!(pages > 0);
        self.add_segment(init, pages)
    }

    fn grow_if_loaded(&self, init: &mut InitState) -> Result<(), CacheError> {
        let (pages, max_load) = {
            let state = self.state.lock().unwrap();
            (state.slots.len() as u32, state.max_load)
        };
        if max_load <= pages / 2 {
            return Ok(());
        }
        let target = self.target_size();
        if target > pages {
            self.add_segment(init, target - pages)
        } else {
            Ok(())
        }
    }

    /// New cache size derived from the CPU count and the observed peak load:
    /// capacity is added until the overload threshold (half the cache)
    /// clears the peak, bounded by the configured maximum.
    fn target_size(&self) -> u32 {
        let max_load = {
            let mut state = self.state.lock().unwrap();
            // A peak beyond the hard cap can only be stale.
            if state.max_load > self.config.max_pages {
                state.max_load = 0;
            }
            state.max_load
        };

        let per_cpu = self.config.pages_per_cpu;
        let mut pages = self.host.cpu_count().saturating_mul(per_cpu);
        while pages < self.config.max_pages && pages / 2 <= max_load {
            pages = pages.saturating_add(per_cpu);
        }
        pages.min(self.config.max_pages)
    }

    fn add_segment(&self, init: &mut InitState, pages: u32) -> Result<(), CacheError> {
        let first_slot = self.state.lock().unwrap().slots.len() as u32;
        let built = build_segment(&*self.host, first_slot, pages)?;

        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.slots.len() as u32, first_slot);
        state.slots.extend(built.slots);
        state.saved_ptes.extend(built.saved_ptes);
        init.segments.push(built.segment);
        debug!(
            added = pages,
            total = state.slots.len(),
            "mapping cache segment added"
        );
        Ok(())
    }

    /// Restores every leaf PTE, shoots down stale translations on all CPUs
    /// and releases the segments. The peak-load statistic survives so the
    /// next setup can size the cache accordingly.
    fn teardown(&self, init: &mut InitState) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        for (slot, saved) in state.slots.iter().zip(&state.saved_ptes) {
            let saved = *saved;
            slot.pte.update(&*self.host, |_| saved);
        }

        let slots = &state.slots;
        let host = &*self.host;
        let broadcast = host.broadcast(&mut |_cpu| {
            for slot in slots.iter() {
                host.invalidate_page(slot.virt);
            }
        });
        if broadcast.is_err() {
            warn!("TLB shootdown broadcast failed; invalidating on the current CPU only");
            for slot in slots.iter() {
                host.invalidate_page(slot.virt);
            }
        }

        for segment in init.segments.drain(..) {
            for obj in segment.pt_objs {
                self.host.free(obj);
            }
            self.host.free(segment.backing);
        }

        state.slots.clear();
        state.saved_ptes.clear();
        state.load = 0;
        debug!(max_load = state.max_load, "mapping cache torn down");
    }
}

impl<H: HostOps> Drop for MappingCache<H> {
    fn drop(&mut self) {
        let users = self
            .init
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .users;
        let pages = self
            .state
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .slots
            .len();
        if users != 0 || pages != 0 {
            error!(users, pages, "mapping cache dropped with live users or segments");
        }
        self.magic = !CACHE_MAGIC;
    }
}

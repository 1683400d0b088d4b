//! Segment construction: one contiguous kernel-virtual range, its backing
//! pages, and the memory objects keeping every paging-structure page on the
//! way to its leaf PTEs mapped for editing.

use std::sync::atomic::{AtomicI32, AtomicU64};
use std::sync::Arc;

use ptwalk::{walk_to_leaf, PAGE_SIZE};
use tracing::debug;

use crate::cache::{Slot, INVALID_PHYS};
use crate::cpuset::CpuSet;
use crate::error::CacheError;
use crate::host::{HostOps, MemObj};

/// One contiguous range of slots contributed to the cache. Created under the
/// init lock, destroyed only at teardown; slot indices are never reused.
#[derive(Debug)]
pub(crate) struct Segment {
    pub first_slot: u32,
    pub pages: u32,
    pub backing: MemObj,
    pub pt_objs: Vec<MemObj>,
}

impl Segment {
    /// Locates the segment owning `slot` by binary search over the
    /// first-slot indices.
    pub fn find(segments: &[Segment], slot: u32) -> Option<&Segment> {
        let i = segments.partition_point(|s| s.first_slot <= slot);
        let seg = &segments[i.checked_sub(1)?];
        (slot < seg.first_slot + seg.pages).then_some(seg)
    }
}

pub(crate) struct BuiltSegment {
    pub segment: Segment,
    pub slots: Vec<Arc<Slot>>,
    pub saved_ptes: Vec<u64>,
}

/// Allocates and probes a new segment of `pages` slots starting at global
/// index `first_slot`. Nothing is published here: on failure every memory
/// object is released and the cache is left untouched.
pub(crate) fn build_segment<H: HostOps>(
    host: &H,
    first_slot: u32,
    pages: u32,
) -> Result<BuiltSegment, CacheError> {
    let backing = host.alloc_pages(pages)?;
    match probe_segment(host, &backing, pages) {
        Ok((slots, saved_ptes, pt_objs)) => Ok(BuiltSegment {
            segment: Segment {
                first_slot,
                pages,
                backing,
                pt_objs,
            },
            slots,
            saved_ptes,
        }),
        Err((err, pt_objs)) => {
            for obj in pt_objs {
                host.free(obj);
            }
            host.free(backing);
            Err(err)
        }
    }
}

type ProbedSlots = (Vec<Arc<Slot>>, Vec<u64>, Vec<MemObj>);

fn probe_segment<H: HostOps>(
    host: &H,
    backing: &MemObj,
    pages: u32,
) -> Result<ProbedSlots, (CacheError, Vec<MemObj>)> {
    let mode = host.paging_mode();
    let cr3 = host.read_cr3();
    let cr4 = host.read_cr4();
    let cpus = host.cpu_count();

    let mut pt_objs: Vec<MemObj> = Vec::new();
    let mut slots = Vec::with_capacity(pages as usize);
    let mut saved_ptes = Vec::with_capacity(pages as usize);
    // Last paging-structure page entered per level; consecutive slots share
    // their parent chain almost always, so each page is mapped once.
    let mut entered = vec![INVALID_PHYS; mode.levels() as usize];

    for n in 0..u64::from(pages) {
        let virt = backing.kernel_va + n * PAGE_SIZE;
        let walk = match walk_to_leaf(host, mode, cr3, cr4, virt) {
            Ok(walk) => walk,
            Err(err) => return Err((err.into(), pt_objs)),
        };

        for (level, &table) in walk.path.iter().enumerate() {
            if entered[level] == table {
                continue;
            }
            entered[level] = table;
            let mut obj = match host.enter_phys(table) {
                Ok(obj) => obj,
                Err(err) => return Err((err.into(), pt_objs)),
            };
            if let Err(err) = host.map_kernel(&mut obj) {
                host.free(obj);
                return Err((err.into(), pt_objs));
            }
            pt_objs.push(obj);
        }

        saved_ptes.push(walk.pte.read(host));
        slots.push(Arc::new(Slot {
            host_phys: AtomicU64::new(INVALID_PHYS),
            virt,
            pte: walk.pte,
            refs: AtomicI32::new(0),
            pending: CpuSet::full(cpus),
        }));
    }

    debug!(
        pages,
        page_tables = pt_objs.len(),
        "probed mapping cache segment"
    );
    Ok((slots, saved_ptes, pt_objs))
}

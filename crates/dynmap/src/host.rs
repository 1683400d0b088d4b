//! The host capability seam.
//!
//! Everything the cache needs from the host OS — CPU topology, cross-CPU
//! work, memory objects, TLB invalidation and the paging configuration — is
//! expressed as one trait so the cache can run against a real ring-0 backend
//! or the simulated machine in [`crate::sim`].

use ptwalk::{PagingMode, PhysMem};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    #[error("host allocation failed")]
    NoMemory,

    #[error("unsupported host configuration: {0}")]
    Unsupported(&'static str),

    #[error("cross-CPU broadcast failed")]
    BroadcastFailed,
}

/// Handle to a host memory object: either freshly allocated kernel pages or
/// an existing physical page entered for kernel mapping.
#[derive(Debug)]
pub struct MemObj {
    pub handle: u64,
    /// Kernel-virtual base. Zero for an entered physical page until
    /// [`HostOps::map_kernel`] assigns one.
    pub kernel_va: u64,
    pub pages: u32,
}

/// Host OS primitives the mapping cache is built on.
///
/// The physical-memory side ([`PhysMem`]) carries the page-table reads and
/// the atomic compare-exchange used for live PTE edits.
pub trait HostOps: PhysMem + Send + Sync {
    /// Number of online CPUs. Must not exceed [`crate::cpuset::MAX_CPUS`].
    fn cpu_count(&self) -> u32;

    fn current_cpu(&self) -> u32;

    /// Runs `f` once per online CPU, on that CPU.
    fn broadcast(&self, f: &mut dyn FnMut(u32)) -> Result<(), HostError>;

    /// Allocates page-backed kernel memory mapped at a fixed virtual base.
    fn alloc_pages(&self, pages: u32) -> Result<MemObj, HostError>;

    /// Wraps an existing physical page so it can be mapped into kernel
    /// space.
    fn enter_phys(&self, paddr: u64) -> Result<MemObj, HostError>;

    /// Maps an entered physical page into kernel space, recording the
    /// address in the object.
    fn map_kernel(&self, obj: &mut MemObj) -> Result<u64, HostError>;

    /// Releases a memory object and any mapping it carries.
    fn free(&self, obj: MemObj);

    /// Architectural single-page TLB invalidation on the current CPU.
    fn invalidate_page(&self, virt: u64);

    fn read_cr3(&self) -> u64;
    fn read_cr4(&self) -> u64;
    fn paging_mode(&self) -> PagingMode;
}

//! Dynamic physical-page mapping cache.
//!
//! A fixed kernel-virtual range is reserved, and the leaf page-table entries
//! backing it are multiplexed across whatever host-physical pages vCPUs need
//! short-lived windows onto during guest execution. Mappings are taken on
//! the hot path (hash plus a short linear probe, one lock, one PTE
//! compare-exchange) and released in batches: every vCPU carries an
//! [`AutoSet`] that is opened on guest entry and drained on exit, so no
//! reference survives a mode transition. TLB coherency is lazy — each slot
//! tracks the CPUs that have not flushed it since its last retarget, and
//! flushes happen on first use per CPU or when a vCPU migrates.
//!
//! The cache talks to the host exclusively through [`HostOps`]; the
//! [`sim`] module provides a complete simulated machine for tests and for
//! embedders without a ring-0 backend.

pub mod autoset;
pub mod cache;
pub mod cpuset;
pub mod error;
pub mod host;
mod segment;
pub mod sim;
pub mod vm;

pub use autoset::{AutoSet, SET_CAPACITY};
pub use cache::{CacheConfig, CacheStats, MappedPage, MappingCache, Slot, SlotSnapshot};
pub use cpuset::{CpuSet, MAX_CPUS};
pub use error::{CacheError, Result};
pub use host::{HostError, HostOps, MemObj};
pub use sim::{SimConfig, SimHost};
pub use vm::{Vm, VmCpu};

#[cfg(test)]
mod tests;

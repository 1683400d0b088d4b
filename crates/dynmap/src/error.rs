use ptwalk::WalkError;
use thiserror::Error;

use crate::host::HostError;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors surfaced to the page manager.
///
/// `Full` and `FullSet` are the caller's cue to drop to a cold path and
/// retry after the guest exits; everything else is a setup failure or API
/// misuse. None of these leave the cache in a corrupt state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Host allocation or broadcast failure during setup, growth or
    /// teardown. Partial state has been unwound.
    #[error(transparent)]
    Host(#[from] HostError),

    /// The paging probe could not reach a 4 KiB leaf for a segment page.
    #[error("paging probe failed: {0}")]
    Probe(#[from] WalkError),

    /// A broken invariant or unusable configuration.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// Every slot is referenced.
    #[error("mapping cache is full ({load}/{pages} slots loaded)")]
    Full { load: u32, pages: u32 },

    /// The auto-set has no room left even after folding duplicates.
    #[error("auto-set is full")]
    FullSet,

    /// An auto-set operation in the wrong open/closed state.
    #[error("{0}")]
    WrongOrder(&'static str),

    /// The VM is not a user of the cache.
    #[error("VM is not a user of the mapping cache")]
    AccessDenied,
}

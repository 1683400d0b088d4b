//! Per-vCPU batches of outstanding mapping references.
//!
//! An auto-set is opened when a vCPU enters guest execution, collects one
//! entry per mapping taken inside the run, and is drained on exit so nothing
//! leaks across the mode transition. Only the owning vCPU ever touches its
//! set.

use std::sync::Arc;

use crate::cache::Slot;
use crate::error::CacheError;
use crate::host::HostOps;

/// Capacity of an auto-set. A vCPU needing more live windows than this in a
/// single guest entry falls back to the cold path.
pub const SET_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub(crate) struct SetEntry {
    pub index: u16,
    pub refs: u16,
    pub slot: Arc<Slot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetState {
    Closed,
    Open,
}

/// A bounded batch of (slot, reference-count) pairs owned by one vCPU.
#[derive(Debug)]
pub struct AutoSet {
    state: SetState,
    entries: Vec<SetEntry>,
}

impl AutoSet {
    pub(crate) fn new() -> Self {
        Self {
            state: SetState::Closed,
            entries: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SetState::Open
    }

    /// Number of entries currently batched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all local reference counts.
    pub fn local_refs(&self) -> u32 {
        self.entries.iter().map(|e| u32::from(e.refs)).sum()
    }

    /// Local reference count held against `slot`, summed across entries.
    pub fn refs_for(&self, slot: u32) -> u32 {
        self.entries
            .iter()
            .filter(|e| u32::from(e.index) == slot)
            .map(|e| u32::from(e.refs))
            .sum()
    }

    pub(crate) fn open(&mut self) -> Result<(), CacheError> {
        if self.is_open() {
            return Err(CacheError::WrongOrder("auto-set is already open"));
        }
        self.entries = Vec::with_capacity(SET_CAPACITY);
        self.state = SetState::Open;
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<Vec<SetEntry>, CacheError> {
        if !self.is_open() {
            return Err(CacheError::WrongOrder("auto-set is not open"));
        }
        self.state = SetState::Closed;
        Ok(std::mem::take(&mut self.entries))
    }

    /// Drops any state without touching cache reference counts; used when a
    /// VM attaches and the storage is of unknown provenance.
    pub(crate) fn reset(&mut self) {
        self.state = SetState::Closed;
        self.entries.clear();
    }

    /// Records one reference to `slot`.
    ///
    /// Below half capacity duplicates are not worth searching for; above it
    /// they are merged, and a full set is compacted before giving up. On
    /// failure the slot handle is returned so the caller can drop the cache
    /// reference it just took.
    pub(crate) fn append(&mut self, index: u16, slot: Arc<Slot>) -> Result<(), Arc<Slot>> {
        debug_assert!(self.is_open());
        if self.entries.len() < SET_CAPACITY / 2 {
            self.entries.push(SetEntry {
                index,
                refs: 1,
                slot,
            });
            return Ok(());
        }

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.index == index && e.refs < u16::MAX)
        {
            entry.refs += 1;
            return Ok(());
        }

        if self.entries.len() >= SET_CAPACITY {
            self.optimise();
        }
        if self.entries.len() < SET_CAPACITY {
            self.entries.push(SetEntry {
                index,
                refs: 1,
                slot,
            });
            Ok(())
        } else {
            Err(slot)
        }
    }

    /// Folds duplicate slots together, compacting with the last entry.
    ///
    /// A pair whose combined count would overflow the entry field stays
    /// split, which keeps repeated runs stable.
    pub(crate) fn optimise(&mut self) {
        let mut i = 0;
        while i < self.entries.len() {
            let mut j = i + 1;
            while j < self.entries.len() {
                let combined = u32::from(self.entries[i].refs) + u32::from(self.entries[j].refs);
                if self.entries[j].index == self.entries[i].index && combined <= u32::from(u16::MAX)
                {
                    self.entries[i].refs = combined as u16;
                    self.entries.swap_remove(j);
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
    }

    /// Re-establishes TLB coherency for the current CPU on every slot the
    /// set references. Touches only the per-slot atomics; the cache lock is
    /// not taken.
    pub(crate) fn migrate<H: HostOps>(&self, host: &H) {
        let cpu = host.current_cpu();
        for entry in &self.entries {
            if entry.slot.pending.test_and_clear(cpu) {
                host.invalidate_page(entry.slot.virt);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_entries(entries: Vec<SetEntry>) -> Self {
        Self {
            state: SetState::Open,
            entries,
        }
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> &[SetEntry] {
        &self.entries
    }
}

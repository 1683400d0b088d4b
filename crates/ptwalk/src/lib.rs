//! x86 paging-structure walking for kernel-virtual addresses.
//!
//! Given a paging mode, the paging root and a virtual address,
//! [`walk_to_leaf`] descends the live hierarchy to the 4 KiB leaf PTE backing
//! that address and returns a width-tagged reference to it, plus the physical
//! addresses of every paging-structure page crossed on the way down. The
//! supported modes are 32-bit legacy paging (two levels, 4-byte entries), PAE
//! (three levels) and 4-level long mode (both 8-byte entries).
//!
//! All memory access goes through the [`PhysMem`] trait. Entry rewrites go
//! through [`PteRef::update`], an atomic compare-exchange loop dispatched on
//! the entry width; there is no pointer arithmetic against live tables
//! anywhere else.

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Host paging modes, as reported by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PagingMode {
    Legacy32,
    Legacy32Global,
    Pae,
    PaeGlobal,
    PaeNx,
    PaeGlobalNx,
    Long64,
    Long64Global,
    Long64Nx,
    Long64GlobalNx,
}

impl PagingMode {
    /// Whether paging-structure entries are the 4-byte legacy format.
    pub const fn is_legacy(self) -> bool {
        matches!(self, PagingMode::Legacy32 | PagingMode::Legacy32Global)
    }

    /// Whether this is one of the PAE (three-level) modes.
    pub const fn is_pae(self) -> bool {
        matches!(
            self,
            PagingMode::Pae | PagingMode::PaeGlobal | PagingMode::PaeNx | PagingMode::PaeGlobalNx
        )
    }

    /// Number of paging-structure levels walked to reach a 4 KiB leaf.
    pub const fn levels(self) -> u32 {
        if self.is_legacy() {
            2
        } else if self.is_pae() {
            3
        } else {
            4
        }
    }
}

/// Physical memory access used for page-table walking and leaf-PTE edits.
///
/// The compare-exchange methods return the value observed immediately before
/// the exchange; the exchange succeeded iff that value equals `current`.
pub trait PhysMem {
    fn read_u32(&self, paddr: u64) -> u32;
    fn read_u64(&self, paddr: u64) -> u64;

    fn cmpxchg_u32(&self, paddr: u64, current: u32, new: u32) -> u32;
    fn cmpxchg_u64(&self, paddr: u64, current: u64, new: u64) -> u64;
}

impl<T: PhysMem + ?Sized> PhysMem for &T {
    #[inline]
    fn read_u32(&self, paddr: u64) -> u32 {
        <T as PhysMem>::read_u32(self, paddr)
    }

    #[inline]
    fn read_u64(&self, paddr: u64) -> u64 {
        <T as PhysMem>::read_u64(self, paddr)
    }

    #[inline]
    fn cmpxchg_u32(&self, paddr: u64, current: u32, new: u32) -> u32 {
        <T as PhysMem>::cmpxchg_u32(self, paddr, current, new)
    }

    #[inline]
    fn cmpxchg_u64(&self, paddr: u64, current: u64, new: u64) -> u64 {
        <T as PhysMem>::cmpxchg_u64(self, paddr, current, new)
    }
}

/// Width-tagged reference to a live leaf PTE: the physical address of the
/// entry plus the entry format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteRef {
    /// 4-byte entry (32-bit legacy paging).
    Legacy(u64),
    /// 8-byte entry (PAE and long mode).
    Wide(u64),
}

impl PteRef {
    /// Physical address of the referenced entry.
    #[inline]
    pub const fn entry_addr(self) -> u64 {
        match self {
            PteRef::Legacy(addr) | PteRef::Wide(addr) => addr,
        }
    }

    #[inline]
    pub const fn is_legacy(self) -> bool {
        matches!(self, PteRef::Legacy(_))
    }

    /// Reads the current entry value, widened to 64 bits.
    #[inline]
    pub fn read(self, mem: &impl PhysMem) -> u64 {
        match self {
            PteRef::Legacy(addr) => u64::from(mem.read_u32(addr)),
            PteRef::Wide(addr) => mem.read_u64(addr),
        }
    }

    /// Rewrites the entry to `f(current)`, retrying the compare-exchange
    /// until it lands. Returns the value the entry held before the final,
    /// successful exchange.
    pub fn update(self, mem: &impl PhysMem, f: impl Fn(u64) -> u64) -> u64 {
        match self {
            PteRef::Legacy(addr) => {
                let mut current = mem.read_u32(addr);
                loop {
                    let new = f(u64::from(current)) as u32;
                    let observed = mem.cmpxchg_u32(addr, current, new);
                    if observed == current {
                        return u64::from(current);
                    }
                    current = observed;
                }
            }
            PteRef::Wide(addr) => {
                let mut current = mem.read_u64(addr);
                loop {
                    let new = f(current);
                    let observed = mem.cmpxchg_u64(addr, current, new);
                    if observed == current {
                        return current;
                    }
                    current = observed;
                }
            }
        }
    }
}

/// A walk failure. All of these are fatal to the caller's setup; the walk
/// mutates nothing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WalkError {
    #[error("paging-structure entry at level {level} is not present")]
    NotPresent { level: u32 },
    #[error("paging-structure entry at level {level} is not writable")]
    NotWritable { level: u32 },
    #[error("large page at level {level}; the range must be backed by 4 KiB leaves")]
    LargePage { level: u32 },
}

/// Result of a successful walk: the leaf reference and the paging-structure
/// pages crossed to reach it, top level first. The last element is the page
/// table holding the leaf entry itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Walk {
    pub pte: PteRef,
    pub path: Vec<u64>,
}

struct Level {
    shift: u32,
    index_mask: u64,
    /// Whether an entry at this level can map a large page.
    large_page: bool,
}

const LEVELS_LEGACY: &[Level] = &[
    Level {
        shift: 22,
        index_mask: 0x3ff,
        large_page: true,
    },
    Level {
        shift: 12,
        index_mask: 0x3ff,
        large_page: false,
    },
];

const LEVELS_PAE: &[Level] = &[
    // The PAE PDPTE has no R/W or PS semantics; only presence is checked.
    Level {
        shift: 30,
        index_mask: 0x3,
        large_page: false,
    },
    Level {
        shift: 21,
        index_mask: 0x1ff,
        large_page: true,
    },
    Level {
        shift: 12,
        index_mask: 0x1ff,
        large_page: false,
    },
];

const LEVELS_LONG: &[Level] = &[
    Level {
        shift: 39,
        index_mask: 0x1ff,
        large_page: false,
    },
    Level {
        shift: 30,
        index_mask: 0x1ff,
        large_page: true,
    },
    Level {
        shift: 21,
        index_mask: 0x1ff,
        large_page: true,
    },
    Level {
        shift: 12,
        index_mask: 0x1ff,
        large_page: false,
    },
];

/// Walks the paging hierarchy rooted at `cr3` down to the leaf PTE backing
/// `vaddr`.
///
/// Every entry on the path must be present, and writable below the top
/// level. Large-page entries are rejected: the caller requires a 4 KiB leaf
/// it can retarget. In legacy mode the PS bit is only honoured when CR4.PSE
/// is set; otherwise the entry is descended as a page-table pointer, which
/// matches the architecture.
pub fn walk_to_leaf(
    mem: &impl PhysMem,
    mode: PagingMode,
    cr3: u64,
    cr4: u64,
    vaddr: u64,
) -> Result<Walk, WalkError> {
    let legacy = mode.is_legacy();
    let levels = if legacy {
        LEVELS_LEGACY
    } else if mode.is_pae() {
        LEVELS_PAE
    } else {
        LEVELS_LONG
    };
    let phys_mask = if legacy {
        PTE_PG_MASK_LEGACY
    } else {
        PTE_PG_MASK_WIDE
    };
    let entry_size = if legacy { 4 } else { 8 };
    let large_pages_enabled = !legacy || cr4 & CR4_PSE != 0;

    let mut table = if legacy {
        (cr3 & 0xffff_ffff) & !0xfff
    } else if mode.is_pae() {
        // The PAE PDPT is 32-byte aligned.
        (cr3 & 0xffff_ffff) & !0x1f
    } else {
        cr3 & PTE_PG_MASK_WIDE
    };

    let mut path = Vec::with_capacity(levels.len());
    for (depth, level) in levels.iter().enumerate() {
        path.push(table);

        let index = (vaddr >> level.shift) & level.index_mask;
        let entry_addr = table + index * entry_size;
        let entry = if legacy {
            u64::from(mem.read_u32(entry_addr))
        } else {
            mem.read_u64(entry_addr)
        };

        let level_no = depth as u32;
        if entry & PTE_P == 0 {
            return Err(WalkError::NotPresent { level: level_no });
        }
        if depth > 0 && entry & PTE_RW == 0 {
            return Err(WalkError::NotWritable { level: level_no });
        }

        if depth + 1 == levels.len() {
            let pte = if legacy {
                PteRef::Legacy(entry_addr)
            } else {
                PteRef::Wide(entry_addr)
            };
            return Ok(Walk { pte, path });
        }

        if level.large_page && large_pages_enabled && entry & PTE_PS != 0 {
            return Err(WalkError::LargePage { level: level_no });
        }

        table = entry & phys_mask;
    }

    unreachable!("level tables are non-empty")
}

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

pub const PTE_P: u64 = 1 << 0;
pub const PTE_RW: u64 = 1 << 1;
pub const PTE_US: u64 = 1 << 2;
pub const PTE_PWT: u64 = 1 << 3;
pub const PTE_PCD: u64 = 1 << 4;
pub const PTE_A: u64 = 1 << 5;
pub const PTE_D: u64 = 1 << 6;
/// PS in non-leaf entries; the leaf PTE uses the same position for PAT.
pub const PTE_PS: u64 = 1 << 7;
pub const PTE_PAT: u64 = 1 << 7;
pub const PTE_G: u64 = 1 << 8;

/// Physical-address field of a 4-byte legacy entry.
pub const PTE_PG_MASK_LEGACY: u64 = 0xffff_f000;
/// Physical-address field of an 8-byte PAE/long-mode entry.
pub const PTE_PG_MASK_WIDE: u64 = 0x000f_ffff_ffff_f000;

pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_PGE: u64 = 1 << 7;

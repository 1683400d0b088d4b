//! Per-VM attach state and per-vCPU auto-set storage.

use crate::autoset::AutoSet;

#[derive(Debug)]
pub struct Vm {
    hw_accel: bool,
    uses_cache: bool,
    vcpus: Vec<VmCpu>,
}

#[derive(Debug)]
pub struct VmCpu {
    set: AutoSet,
}

impl Vm {
    /// A VM with `vcpus` virtual CPUs. Only hardware-assisted VMs map
    /// through the cache; others get `false` back from attach.
    pub fn new(vcpus: usize, hw_accel: bool) -> Self {
        Self {
            hw_accel,
            uses_cache: false,
            vcpus: (0..vcpus).map(|_| VmCpu { set: AutoSet::new() }).collect(),
        }
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn hw_accel(&self) -> bool {
        self.hw_accel
    }

    /// Whether this VM is currently attached as a cache user.
    pub fn uses_cache(&self) -> bool {
        self.uses_cache
    }

    /// The vCPU's auto-set, for inspection.
    pub fn auto_set(&self, vcpu: usize) -> Option<&AutoSet> {
        self.vcpus.get(vcpu).map(|c| &c.set)
    }

    pub(crate) fn set_uses_cache(&mut self, uses: bool) {
        self.uses_cache = uses;
    }

    pub(crate) fn set(&self, vcpu: usize) -> Option<&AutoSet> {
        self.vcpus.get(vcpu).map(|c| &c.set)
    }

    pub(crate) fn set_mut(&mut self, vcpu: usize) -> Option<&mut AutoSet> {
        self.vcpus.get_mut(vcpu).map(|c| &mut c.set)
    }

    pub(crate) fn sets_mut(&mut self) -> impl Iterator<Item = &mut AutoSet> + '_ {
        self.vcpus.iter_mut().map(|c| &mut c.set)
    }

    pub(crate) fn reset_sets(&mut self) {
        for vcpu in &mut self.vcpus {
            vcpu.set.reset();
        }
    }
}

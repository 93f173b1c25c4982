//! Planning-only projection of cluster state.
//!
//! Planners copy the hosts they may touch into a [`SimulatedCluster`]
//! and apply candidate migrations to it. The snapshot itself is never
//! mutated, and the simulation is discarded when planning finishes.

use std::collections::BTreeMap;

use vmplan_core::{
    ClusterMetrics, Host, HostName, HostStatus, ResourceState, Vm, VmId, apply_delta,
    compute_state,
};

/// Mutable projection of one host.
#[derive(Debug, Clone)]
pub struct SimulatedHostState {
    pub name: HostName,
    pub status: HostStatus,
    pub vms: BTreeMap<VmId, Vm>,
    state: ResourceState,
}

impl SimulatedHostState {
    pub fn from_host(host: &Host) -> Self {
        Self {
            name: host.name.clone(),
            status: host.status,
            vms: host.vms.iter().map(|vm| (vm.id, vm.clone())).collect(),
            state: compute_state(host),
        }
    }

    pub fn state(&self) -> &ResourceState {
        &self.state
    }

    pub fn cores(&self) -> u32 {
        self.state.cores
    }

    /// State this host would have with `vm` added.
    pub fn projected_with(&self, vm: &Vm) -> ResourceState {
        apply_delta(&self.state, std::slice::from_ref(vm), &[])
    }

    /// State this host would have with `vm` removed.
    pub fn projected_without(&self, vm: &Vm) -> ResourceState {
        apply_delta(&self.state, &[], std::slice::from_ref(vm))
    }

    pub fn add_vm(&mut self, mut vm: Vm) {
        vm.host = self.name.clone();
        self.state = apply_delta(&self.state, std::slice::from_ref(&vm), &[]);
        self.vms.insert(vm.id, vm);
    }

    pub fn remove_vm(&mut self, id: VmId) -> Option<Vm> {
        let vm = self.vms.remove(&id)?;
        self.state = apply_delta(&self.state, &[], std::slice::from_ref(&vm));
        Some(vm)
    }

    /// Largest effective disk among resident VMs.
    pub fn largest_disk(&self) -> u64 {
        self.vms.values().map(Vm::effective_disk).max().unwrap_or(0)
    }
}

/// Simulated state of every host taking part in a planning run, ordered
/// by host name.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCluster {
    hosts: BTreeMap<HostName, SimulatedHostState>,
}

impl SimulatedCluster {
    pub fn from_hosts<'a>(hosts: impl IntoIterator<Item = &'a Host>) -> Self {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| (h.name.clone(), SimulatedHostState::from_host(h)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SimulatedHostState> {
        self.hosts.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SimulatedHostState> {
        self.hosts.get_mut(name)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &SimulatedHostState> {
        self.hosts.values()
    }

    pub fn into_hosts(self) -> impl Iterator<Item = SimulatedHostState> {
        self.hosts.into_values()
    }

    /// Move a VM between two simulated hosts. Returns the moved VM, or
    /// `None` (and changes nothing) if either host or the VM is missing.
    pub fn move_vm(&mut self, vm_id: VmId, from: &str, to: &str) -> Option<Vm> {
        if from == to || !self.hosts.contains_key(to) {
            return None;
        }
        let vm = self.hosts.get_mut(from)?.remove_vm(vm_id)?;
        let target = self.hosts.get_mut(to)?;
        target.add_vm(vm.clone());
        target.vms.get(&vm_id).cloned()
    }

    pub fn metrics(&self) -> ClusterMetrics {
        ClusterMetrics::from_states(self.hosts.values().map(SimulatedHostState::state))
    }

    /// Sum over hosts of |RAM% − avg|.
    pub fn ram_deviation_sum(&self, avg_ram_percent: f64) -> f64 {
        self.hosts
            .values()
            .map(|h| (h.state().ram_percent() - avg_ram_percent).abs())
            .sum()
    }
}

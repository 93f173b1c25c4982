//! Derived resource state for hosts and the cluster.
//!
//! A [`ResourceState`] is a point-in-time view of one host computed from
//! its resident VMs. Only running VMs count toward vCPU, CPU and RAM
//! usage; storage and allocated RAM count every resident VM regardless of
//! power state.
//! Percentages are never stored: they are recomputed from the used/total
//! pair on every call and clamped to `0..=100`.

use serde::{Deserialize, Serialize};

use crate::config::ScoringWeights;
use crate::constraints::MinFreeThresholds;
use crate::types::{Host, Vm};

/// Resource usage of a single host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Logical CPUs of the host.
    pub cores: u32,
    /// Resident VMs, running or not.
    pub vm_count: usize,
    pub running_vms: usize,
    /// vCPUs allocated to running VMs.
    pub vcpus: u32,
    /// Estimated physical CPU consumption in cores.
    pub cpu_used_cores: f64,
    pub ram_used: u64,
    /// RAM reserved by every resident VM, powered off ones included.
    pub ram_allocated: u64,
    pub ram_total: u64,
    pub storage_used: u64,
    pub storage_total: u64,
}

impl ResourceState {
    /// State of a host with no VMs.
    pub fn empty(cores: u32, ram_total: u64, storage_total: u64) -> Self {
        Self {
            cores,
            ram_total,
            storage_total,
            ..Self::default()
        }
    }

    pub fn cpu_percent(&self) -> f64 {
        percent(self.cpu_used_cores, f64::from(self.cores))
    }

    pub fn ram_percent(&self) -> f64 {
        percent(self.ram_used as f64, self.ram_total as f64)
    }

    pub fn storage_percent(&self) -> f64 {
        percent(self.storage_used as f64, self.storage_total as f64)
    }

    /// Allocated vCPUs per logical CPU, in percent. Not clamped above:
    /// oversubscription is normal.
    pub fn vcpu_percent(&self) -> f64 {
        if self.cores == 0 {
            return 0.0;
        }
        f64::from(self.vcpus) / f64::from(self.cores) * 100.0
    }

    pub fn ram_free(&self) -> u64 {
        self.ram_total.saturating_sub(self.ram_used)
    }

    pub fn storage_free(&self) -> u64 {
        self.storage_total.saturating_sub(self.storage_used)
    }

    /// Weighted utilization. Lower is a better destination.
    pub fn utilization_score(&self, weights: &ScoringWeights) -> f64 {
        weights.cpu * self.cpu_percent()
            + weights.ram * self.ram_percent()
            + weights.storage * self.storage_percent()
    }

    /// Population standard deviation of {CPU%, RAM%, Storage%}. Lower
    /// means the host's resources are consumed evenly.
    pub fn resource_spread(&self) -> f64 {
        std_dev(&[
            self.cpu_percent(),
            self.ram_percent(),
            self.storage_percent(),
        ])
    }

    fn evacuate(&mut self) {
        self.running_vms = 0;
        self.vcpus = 0;
        self.cpu_used_cores = 0.0;
        self.ram_used = 0;
        self.ram_allocated = 0;
        self.storage_used = 0;
    }
}

/// Compute the resource state of a host from its resident VMs.
pub fn compute_state(host: &Host) -> ResourceState {
    let empty = ResourceState::empty(host.cores, host.ram_bytes, host.storage_bytes);
    apply_delta(&empty, &host.vms, &[])
}

/// Project a state after adding and removing VMs.
///
/// Removal saturates at zero. A host left with no VMs has its usage reset
/// to exactly zero rather than carrying a floating-point residual.
pub fn apply_delta(state: &ResourceState, added: &[Vm], removed: &[Vm]) -> ResourceState {
    let mut next = state.clone();

    for vm in added {
        next.vm_count += 1;
        next.storage_used = next.storage_used.saturating_add(vm.effective_disk());
        next.ram_allocated = next.ram_allocated.saturating_add(vm.ram_bytes);
        if vm.is_running() {
            next.running_vms += 1;
            next.vcpus = next.vcpus.saturating_add(vm.vcpus);
            next.cpu_used_cores += vm.cpu_load_cores();
            next.ram_used = next.ram_used.saturating_add(vm.ram_bytes);
        }
    }

    for vm in removed {
        next.vm_count = next.vm_count.saturating_sub(1);
        next.storage_used = next.storage_used.saturating_sub(vm.effective_disk());
        next.ram_allocated = next.ram_allocated.saturating_sub(vm.ram_bytes);
        if vm.is_running() {
            next.running_vms = next.running_vms.saturating_sub(1);
            next.vcpus = next.vcpus.saturating_sub(vm.vcpus);
            next.cpu_used_cores = (next.cpu_used_cores - vm.cpu_load_cores()).max(0.0);
            next.ram_used = next.ram_used.saturating_sub(vm.ram_bytes);
        }
    }

    if next.vm_count == 0 {
        next.evacuate();
    }
    next
}

/// Whether `vm` fits on a host in `state` while keeping the minimum free
/// thresholds.
///
/// RAM is checked as allocated RAM of every resident VM plus the incoming
/// one, powered off or not, so each of them can still be started.
pub fn has_capacity(state: &ResourceState, vm: &Vm, min_free: &MinFreeThresholds) -> bool {
    if state.ram_total == 0 || state.storage_total == 0 {
        return false;
    }

    let ram_limit = state.ram_total as f64 * (1.0 - min_free.ram_percent / 100.0);
    if state.ram_allocated.saturating_add(vm.ram_bytes) as f64 > ram_limit {
        return false;
    }

    let storage_limit = state.storage_total as f64 * (1.0 - min_free.storage_percent / 100.0);
    if state.storage_used.saturating_add(vm.effective_disk()) as f64 > storage_limit {
        return false;
    }

    if vm.is_running() {
        if state.cores == 0 {
            return false;
        }
        let cpu_after =
            (state.cpu_used_cores + vm.cpu_load_cores()) / f64::from(state.cores) * 100.0;
        if cpu_after > 100.0 - min_free.cpu_percent {
            return false;
        }
    }

    true
}

/// Cluster-wide totals and the averages hosts are balanced toward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub host_count: usize,
    pub vm_count: usize,
    pub total_cores: u64,
    pub total_vcpus: u64,
    pub cpu_used_cores: f64,
    pub ram_used: u64,
    pub ram_total: u64,
    pub storage_used: u64,
    pub storage_total: u64,
}

impl ClusterMetrics {
    pub fn from_states<'a>(states: impl IntoIterator<Item = &'a ResourceState>) -> Self {
        let mut metrics = ClusterMetrics::default();
        for state in states {
            metrics.host_count += 1;
            metrics.vm_count += state.vm_count;
            metrics.total_cores += u64::from(state.cores);
            metrics.total_vcpus += u64::from(state.vcpus);
            metrics.cpu_used_cores += state.cpu_used_cores;
            metrics.ram_used += state.ram_used;
            metrics.ram_total += state.ram_total;
            metrics.storage_used += state.storage_used;
            metrics.storage_total += state.storage_total;
        }
        metrics
    }

    /// Capacity-weighted average physical CPU%.
    pub fn avg_cpu_percent(&self) -> f64 {
        percent(self.cpu_used_cores, self.total_cores as f64)
    }

    pub fn avg_vcpu_percent(&self) -> f64 {
        if self.total_cores == 0 {
            return 0.0;
        }
        self.total_vcpus as f64 / self.total_cores as f64 * 100.0
    }

    pub fn avg_ram_percent(&self) -> f64 {
        percent(self.ram_used as f64, self.ram_total as f64)
    }

    pub fn avg_storage_percent(&self) -> f64 {
        percent(self.storage_used as f64, self.storage_total as f64)
    }

    pub fn avg_vm_count(&self) -> f64 {
        if self.host_count == 0 {
            return 0.0;
        }
        self.vm_count as f64 / self.host_count as f64
    }
}

fn percent(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    (used / total * 100.0).clamp(0.0, 100.0)
}

/// Population standard deviation. Zero for an empty slice.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GIB, HostStatus, VmStatus};

    fn make_vm(id: u32, vcpus: u32, ram_gib: u64, disk_gib: u64, status: VmStatus) -> Vm {
        Vm {
            id,
            name: format!("vm-{id}"),
            host: "pve1".to_string(),
            status,
            vcpus,
            cpu_usage: 50.0,
            ram_bytes: ram_gib * GIB,
            ram_used_bytes: 0,
            disk_bytes: disk_gib * GIB,
            disk_used_bytes: None,
            uptime_secs: 0,
            migratable: true,
        }
    }

    fn make_host(vms: Vec<Vm>) -> Host {
        Host {
            name: "pve1".to_string(),
            status: HostStatus::Online,
            cores: 16,
            cpu_model: String::new(),
            ram_bytes: 64 * GIB,
            storage_bytes: 1000 * GIB,
            vms,
        }
    }

    #[test]
    fn stopped_vms_only_count_toward_storage() {
        let host = make_host(vec![
            make_vm(1, 4, 16, 100, VmStatus::Running),
            make_vm(2, 8, 32, 200, VmStatus::Stopped),
        ]);
        let state = compute_state(&host);

        assert_eq!(state.vm_count, 2);
        assert_eq!(state.running_vms, 1);
        assert_eq!(state.vcpus, 4);
        assert_eq!(state.ram_used, 16 * GIB);
        assert_eq!(state.ram_allocated, 48 * GIB);
        assert_eq!(state.storage_used, 300 * GIB);
        assert!((state.ram_percent() - 25.0).abs() < 1e-9);
        assert!((state.storage_percent() - 30.0).abs() < 1e-9);
        // 4 vCPUs at 50% on 16 cores.
        assert!((state.cpu_percent() - 12.5).abs() < 1e-9);
        assert!((state.vcpu_percent() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn compute_state_is_idempotent() {
        let host = make_host(vec![
            make_vm(1, 4, 16, 100, VmStatus::Running),
            make_vm(2, 2, 8, 50, VmStatus::Running),
        ]);
        assert_eq!(compute_state(&host), compute_state(&host));
    }

    #[test]
    fn add_then_remove_restores_counters() {
        let host = make_host(vec![make_vm(1, 4, 16, 100, VmStatus::Running)]);
        let before = compute_state(&host);
        let vm = make_vm(9, 6, 12, 80, VmStatus::Running);

        let added = apply_delta(&before, std::slice::from_ref(&vm), &[]);
        let restored = apply_delta(&added, &[], std::slice::from_ref(&vm));

        assert_eq!(restored.vm_count, before.vm_count);
        assert_eq!(restored.vcpus, before.vcpus);
        assert_eq!(restored.ram_used, before.ram_used);
        assert_eq!(restored.storage_used, before.storage_used);
    }

    #[test]
    fn evacuated_host_resets_to_zero() {
        let vm = make_vm(1, 3, 16, 100, VmStatus::Running);
        let mut odd = vm.clone();
        odd.cpu_usage = 33.3;
        let host = make_host(vec![odd.clone()]);
        let state = compute_state(&host);

        let empty = apply_delta(&state, &[], std::slice::from_ref(&odd));
        assert_eq!(empty.vm_count, 0);
        assert_eq!(empty.cpu_used_cores, 0.0);
        assert_eq!(empty.ram_used, 0);
        assert_eq!(empty.storage_used, 0);
        assert_eq!(empty.ram_total, 64 * GIB);
    }

    #[test]
    fn removal_never_goes_negative() {
        let state = ResourceState::empty(8, 32 * GIB, 500 * GIB);
        let ghost = make_vm(7, 4, 16, 100, VmStatus::Running);
        let next = apply_delta(&state, &[], std::slice::from_ref(&ghost));

        assert_eq!(next.vm_count, 0);
        assert_eq!(next.ram_used, 0);
        assert!(next.ram_percent() >= 0.0);
        assert!(next.cpu_percent() >= 0.0);
    }

    #[test]
    fn percentages_clamp_when_overcommitted() {
        let host = make_host(vec![
            make_vm(1, 8, 48, 600, VmStatus::Running),
            make_vm(2, 8, 48, 600, VmStatus::Running),
        ]);
        let state = compute_state(&host);
        assert_eq!(state.ram_percent(), 100.0);
        assert_eq!(state.storage_percent(), 100.0);
    }

    #[test]
    fn has_capacity_checks_allocated_ram_of_stopped_vm() {
        let host = make_host(vec![make_vm(1, 4, 48, 100, VmStatus::Running)]);
        let state = compute_state(&host);
        let stopped = make_vm(2, 2, 24, 10, VmStatus::Stopped);

        assert!(!has_capacity(&state, &stopped, &MinFreeThresholds::default()));

        let small = make_vm(3, 2, 8, 10, VmStatus::Stopped);
        assert!(has_capacity(&state, &small, &MinFreeThresholds::default()));
    }

    #[test]
    fn resident_stopped_vm_keeps_its_ram_reserved() {
        let host = make_host(vec![make_vm(1, 4, 40, 100, VmStatus::Stopped)]);
        let state = compute_state(&host);
        assert_eq!(state.ram_used, 0);

        let another = make_vm(2, 4, 40, 100, VmStatus::Stopped);
        assert!(!has_capacity(&state, &another, &MinFreeThresholds::default()));

        let after = apply_delta(&state, &[], &host.vms);
        assert_eq!(after.ram_allocated, 0);
        assert!(has_capacity(&after, &another, &MinFreeThresholds::default()));
    }

    #[test]
    fn has_capacity_respects_min_free() {
        let host = make_host(vec![make_vm(1, 4, 40, 100, VmStatus::Running)]);
        let state = compute_state(&host);
        let vm = make_vm(2, 2, 16, 10, VmStatus::Running);

        // 56 GiB of 64 fits with no reserve but not with 20% kept free.
        assert!(has_capacity(&state, &vm, &MinFreeThresholds::default()));
        let strict = MinFreeThresholds {
            ram_percent: 20.0,
            ..MinFreeThresholds::default()
        };
        assert!(!has_capacity(&state, &vm, &strict));
    }

    #[test]
    fn utilization_score_uses_weights() {
        let host = make_host(vec![make_vm(1, 4, 16, 100, VmStatus::Running)]);
        let state = compute_state(&host);
        let score = state.utilization_score(&ScoringWeights::default());
        // 0.4·12.5 + 0.4·25 + 0.2·10
        assert!((score - 17.0).abs() < 1e-9);
    }

    #[test]
    fn cluster_metrics_are_capacity_weighted() {
        let big = ResourceState {
            cores: 64,
            vm_count: 10,
            running_vms: 10,
            vcpus: 64,
            cpu_used_cores: 32.0,
            ram_used: 96 * GIB,
            ram_allocated: 96 * GIB,
            ram_total: 128 * GIB,
            storage_used: 0,
            storage_total: 1000 * GIB,
        };
        let small = ResourceState {
            cores: 16,
            vm_count: 2,
            running_vms: 2,
            vcpus: 4,
            cpu_used_cores: 0.0,
            ram_used: 0,
            ram_allocated: 0,
            ram_total: 32 * GIB,
            storage_used: 0,
            storage_total: 1000 * GIB,
        };
        let metrics = ClusterMetrics::from_states([&big, &small]);

        assert_eq!(metrics.host_count, 2);
        assert!((metrics.avg_ram_percent() - 60.0).abs() < 1e-9);
        assert!((metrics.avg_cpu_percent() - 40.0).abs() < 1e-9);
        assert!((metrics.avg_vcpu_percent() - 85.0).abs() < 1e-9);
        assert!((metrics.avg_vm_count() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn std_dev_of_constant_is_zero() {
        assert_eq!(std_dev(&[5.0, 5.0, 5.0]), 0.0);
        assert!((std_dev(&[0.0, 10.0]) - 5.0).abs() < 1e-9);
        assert_eq!(std_dev(&[]), 0.0);
    }
}

//! VM selection policies for single-source planning.
//!
//! Each [`SelectionMode`] maps to one policy that picks VMs off the
//! source host. Only migratable VMs are ever selected, and only running
//! ones, except in storage mode where powered-off VMs free disk too.

use tracing::{debug, warn};

use vmplan_core::{ScoringWeights, SelectionMode, Vm};

use crate::scorer::resource_footprint;
use crate::simulation::SimulatedHostState;
use crate::suggestion::UnplacedVm;

/// VMs chosen for migration, in the order they should be placed.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub vms: Vec<Vm>,
    /// Explicitly requested VMs that cannot be migrated at all.
    pub rejected: Vec<UnplacedVm>,
}

/// Pick VMs from `source` according to `mode`.
pub fn select_vms(
    source: &SimulatedHostState,
    mode: &SelectionMode,
    weights: &ScoringWeights,
) -> Selection {
    let footprint = |vm: &Vm| resource_footprint(vm, source.state(), weights);

    let selection = match mode {
        SelectionMode::Vms { ids } => select_explicit(source, ids),
        SelectionMode::Count { count } => {
            let mut candidates = running_candidates(source);
            candidates.sort_by(|a, b| footprint(a).total_cmp(&footprint(b)).then(a.id.cmp(&b.id)));
            Selection {
                vms: candidates.into_iter().take(*count).cloned().collect(),
                rejected: Vec::new(),
            }
        }
        SelectionMode::Vcpus { target } => accumulate(
            running_candidates(source),
            |vm| f64::from(vm.vcpus),
            f64::from(*target),
            "vcpus",
        ),
        SelectionMode::CpuPercent { target } => {
            let cores = f64::from(source.cores().max(1));
            accumulate(
                running_candidates(source),
                |vm| vm.cpu_load_cores() / cores * 100.0,
                *target,
                "cpu_percent",
            )
        }
        SelectionMode::Ram { target_bytes } => accumulate(
            running_candidates(source),
            |vm| vm.ram_bytes as f64,
            *target_bytes as f64,
            "ram_bytes",
        ),
        SelectionMode::Storage { target_bytes } => {
            let candidates = source.vms.values().filter(|vm| vm.migratable).collect();
            accumulate(
                candidates,
                |vm| vm.effective_disk() as f64,
                *target_bytes as f64,
                "storage_bytes",
            )
        }
        SelectionMode::Age { min_age_days } => {
            let mut candidates: Vec<&Vm> = running_candidates(source)
                .into_iter()
                .filter(|vm| vm.age_days() >= u64::from(*min_age_days))
                .collect();
            candidates.sort_by(|a, b| b.uptime_secs.cmp(&a.uptime_secs).then(a.id.cmp(&b.id)));
            Selection {
                vms: candidates.into_iter().cloned().collect(),
                rejected: Vec::new(),
            }
        }
        SelectionMode::All => {
            // Largest first so the big VMs get the widest choice of hosts.
            let mut candidates = running_candidates(source);
            candidates.sort_by(|a, b| footprint(b).total_cmp(&footprint(a)).then(a.id.cmp(&b.id)));
            Selection {
                vms: candidates.into_iter().cloned().collect(),
                rejected: Vec::new(),
            }
        }
        SelectionMode::BalanceCluster => Selection::default(),
    };

    debug!(
        host = %source.name,
        mode = mode.label(),
        selected = selection.vms.len(),
        rejected = selection.rejected.len(),
        "selected VMs"
    );
    selection
}

fn running_candidates(source: &SimulatedHostState) -> Vec<&Vm> {
    source
        .vms
        .values()
        .filter(|vm| vm.migratable && vm.is_running())
        .collect()
}

fn select_explicit(source: &SimulatedHostState, ids: &[u32]) -> Selection {
    let mut selection = Selection::default();
    for id in ids {
        let Some(vm) = source.vms.get(id) else {
            selection.rejected.push(UnplacedVm {
                vm_id: *id,
                vm_name: String::new(),
                reason: format!("not resident on {}", source.name),
            });
            continue;
        };
        if !vm.migratable {
            selection.rejected.push(UnplacedVm {
                vm_id: vm.id,
                vm_name: vm.name.clone(),
                reason: "vm is not migratable".to_string(),
            });
        } else if !vm.is_running() {
            selection.rejected.push(UnplacedVm {
                vm_id: vm.id,
                vm_name: vm.name.clone(),
                reason: "vm is not running".to_string(),
            });
        } else {
            selection.vms.push(vm.clone());
        }
    }
    selection
}

/// Smallest-first accumulation until the summed metric reaches `target`.
/// VMs contributing nothing to the metric are skipped.
fn accumulate(
    mut candidates: Vec<&Vm>,
    metric: impl Fn(&Vm) -> f64,
    target: f64,
    metric_name: &'static str,
) -> Selection {
    candidates.retain(|vm| metric(vm) > 0.0);
    candidates.sort_by(|a, b| metric(a).total_cmp(&metric(b)).then(a.id.cmp(&b.id)));

    let mut sum = 0.0;
    let mut vms = Vec::new();
    for vm in candidates {
        if sum >= target {
            break;
        }
        sum += metric(vm);
        vms.push(vm.clone());
    }

    if sum < target {
        warn!(
            metric = metric_name,
            reached = sum,
            target,
            "selection target not reachable with eligible VMs"
        );
    }

    Selection {
        vms,
        rejected: Vec::new(),
    }
}

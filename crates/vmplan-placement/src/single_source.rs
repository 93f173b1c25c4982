//! Single-source planning — offload VMs from one designated host.
//!
//! Given a validated request naming a source host, the planner:
//! 1. Selects VMs off the source (see [`crate::selector`])
//! 2. Picks the best destination per VM among permitted hosts
//! 3. Applies each accepted move to the simulated destination so later
//!    VMs see the capacity already taken
//!
//! Migrate-all runs through the bounded worker pool in
//! [`crate::migrate_all`] instead of step 2–3.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use vmplan_core::{
    ClusterSnapshot, Host, HostName, MigrationConstraints, MinFreeThresholds, PlanError, PlanResult,
    PlannerConfig, ScoringWeights, SelectionMode, Vm,
};

use crate::migrate_all::plan_migrate_all_parallel;
use crate::scorer::{DestinationScore, rank_destinations};
use crate::selector::select_vms;
use crate::simulation::{SimulatedCluster, SimulatedHostState};
use crate::suggestion::{MigrationSuggestion, UnplacedVm};

/// Placement rules shared by the single-source planners.
#[derive(Debug, Clone)]
pub struct PlacementRules {
    pub weights: ScoringWeights,
    pub min_free: MinFreeThresholds,
    pub max_vms_per_host: Option<usize>,
}

impl PlacementRules {
    pub fn new(constraints: &MigrationConstraints, config: &PlannerConfig) -> Self {
        Self {
            weights: config.scoring.clone(),
            min_free: constraints.min_free.clone(),
            max_vms_per_host: constraints.max_vms_per_host,
        }
    }

    /// Whether a host that already received `planned` VMs may take another.
    pub fn below_vm_limit(&self, planned: usize) -> bool {
        self.max_vms_per_host.is_none_or(|max| planned < max)
    }
}

/// Output of a single-source run.
#[derive(Debug, Clone, Default)]
pub struct SingleSourceOutcome {
    pub suggestions: Vec<MigrationSuggestion>,
    pub unplaced: Vec<UnplacedVm>,
}

/// Plan migrations off the request's source host.
pub fn plan_single_source(
    snapshot: &ClusterSnapshot,
    constraints: &MigrationConstraints,
    config: &PlannerConfig,
) -> PlanResult<SingleSourceOutcome> {
    let source_name = constraints
        .source_host
        .as_deref()
        .ok_or_else(|| PlanError::SourceHostNotFound(String::new()))?;
    let source_host = snapshot
        .host(source_name)
        .ok_or_else(|| PlanError::SourceHostNotFound(source_name.to_string()))?;

    if !source_host.is_eligible() {
        warn!(host = source_name, status = ?source_host.status, "source host is not online");
    }

    let source = SimulatedHostState::from_host(source_host);
    let destinations: Vec<&Host> = snapshot
        .eligible_hosts()
        .filter(|h| h.name != source_name && !constraints.is_excluded(&h.name))
        .collect();

    let rules = PlacementRules::new(constraints, config);
    let selection = select_vms(&source, &constraints.mode, &rules.weights);

    let mut outcome = SingleSourceOutcome {
        suggestions: Vec::new(),
        unplaced: selection.rejected,
    };

    if selection.vms.is_empty() {
        info!(host = source_name, mode = constraints.mode.label(), "no VMs selected");
        return Ok(outcome);
    }

    if destinations.is_empty() {
        warn!(host = source_name, "no eligible destination hosts");
        outcome.unplaced.extend(selection.vms.iter().map(|vm| UnplacedVm {
            vm_id: vm.id,
            vm_name: vm.name.clone(),
            reason: "no eligible destination hosts".to_string(),
        }));
        return Ok(outcome);
    }

    let suggestions = if constraints.mode == SelectionMode::All {
        plan_migrate_all_parallel(
            &source,
            &destinations,
            selection.vms,
            &rules,
            &config.single_source,
        )
    } else {
        let mut cluster = SimulatedCluster::from_hosts(destinations.iter().copied());
        place_sequentially(&source, &mut cluster, &selection.vms, &rules)
    };

    for suggestion in suggestions {
        if suggestion.is_placed() {
            outcome.suggestions.push(suggestion);
        } else {
            outcome.unplaced.push(UnplacedVm::from(&suggestion));
        }
    }

    info!(
        host = source_name,
        mode = constraints.mode.label(),
        placed = outcome.suggestions.len(),
        unplaced = outcome.unplaced.len(),
        "single-source plan computed"
    );
    Ok(outcome)
}

/// Place VMs one after another, each against the state left by the
/// previous placements.
pub fn place_sequentially(
    source: &SimulatedHostState,
    cluster: &mut SimulatedCluster,
    vms: &[Vm],
    rules: &PlacementRules,
) -> Vec<MigrationSuggestion> {
    let mut planned: HashMap<HostName, usize> = HashMap::new();
    let mut suggestions = Vec::with_capacity(vms.len());

    for vm in vms {
        match choose_destination(cluster, vm, &planned, rules) {
            Ok(best) => {
                let target_cores = cluster.get(&best.host).map_or(0, SimulatedHostState::cores);
                let reason = describe_choice(cluster.get(&best.host), &best);
                if let Some(host) = cluster.get_mut(&best.host) {
                    host.add_vm(vm.clone());
                }
                *planned.entry(best.host.clone()).or_insert(0) += 1;
                debug!(vm = vm.id, target = %best.host, score = best.score, "destination chosen");
                suggestions.push(MigrationSuggestion::new(
                    vm,
                    &source.name,
                    source.cores(),
                    &best.host,
                    target_cores,
                    best.score,
                    reason,
                ));
            }
            Err(reason) => {
                debug!(vm = vm.id, %reason, "no destination");
                suggestions.push(MigrationSuggestion::unplaced(
                    vm,
                    &source.name,
                    source.cores(),
                    reason,
                ));
            }
        }
    }
    suggestions
}

/// Best destination for `vm`, or the reason there is none.
pub fn choose_destination(
    cluster: &SimulatedCluster,
    vm: &Vm,
    planned: &HashMap<HostName, usize>,
    rules: &PlacementRules,
) -> Result<DestinationScore, String> {
    let mut at_limit = 0usize;
    let open = cluster.hosts().filter(|h| {
        let ok = rules.below_vm_limit(planned.get(&h.name).copied().unwrap_or(0));
        if !ok {
            at_limit += 1;
        }
        ok
    });

    let ranked = rank_destinations(open, vm, &rules.min_free, &rules.weights);
    match ranked.into_iter().next() {
        Some(best) => Ok(best),
        None if at_limit == cluster.len() => {
            Err("every destination reached the max VMs per host".to_string())
        }
        None => Err(no_capacity_reason(vm)),
    }
}

pub(crate) fn no_capacity_reason(vm: &Vm) -> String {
    format!(
        "no destination with capacity for {} vCPU / {:.1} GiB RAM / {:.1} GiB disk",
        vm.vcpus,
        vm.ram_gib(),
        vm.effective_disk_gib()
    )
}

pub(crate) fn describe_choice(host: Option<&SimulatedHostState>, best: &DestinationScore) -> String {
    let ram_before = host.map_or(0.0, |h| h.state().ram_percent());
    format!(
        "best fit (score {:.1}): RAM {:.1}% -> {:.1}%, CPU {:.1}%, storage {:.1}% after move",
        best.score,
        ram_before,
        best.projected.ram_percent(),
        best.projected.cpu_percent(),
        best.projected.storage_percent()
    )
}

//! Destination scoring for single-source planning.
//!
//! Evaluates candidate hosts for one VM using a weighted combination of:
//! - **Utilization**: prefer hosts that stay lightly loaded after the move
//! - **Spread**: prefer hosts whose CPU, RAM and storage usage stay even
//! - **Capacity**: reject hosts that can't fit the VM at all

use std::cmp::Ordering;

use vmplan_core::{HostName, MinFreeThresholds, ResourceState, ScoringWeights, Vm, has_capacity};

use crate::simulation::SimulatedHostState;

/// Scored candidate destination for a single VM.
#[derive(Debug, Clone)]
pub struct DestinationScore {
    pub host: HostName,
    /// Composite score (higher = better). Range: 0.0..=100.0 with default weights.
    pub score: f64,
    /// Host state with the VM added.
    pub projected: ResourceState,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    /// Weighted utilization after the move (lower = emptier host).
    pub utilization: f64,
    /// Standard deviation of {CPU%, RAM%, Storage%} after the move.
    pub spread: f64,
}

/// Score a projected host state.
pub fn score_projected(projected: &ResourceState, weights: &ScoringWeights) -> (f64, ScoreBreakdown) {
    let utilization = projected.utilization_score(weights);
    let spread = projected.resource_spread();
    let score = weights.utilization * (100.0 - utilization) + weights.balance * (100.0 - spread);
    (score, ScoreBreakdown { utilization, spread })
}

/// Score a single host as destination for `vm`.
pub fn score_destination(
    host: &SimulatedHostState,
    vm: &Vm,
    min_free: &MinFreeThresholds,
    weights: &ScoringWeights,
) -> Option<DestinationScore> {
    if !has_capacity(host.state(), vm, min_free) {
        return None;
    }

    let projected = host.projected_with(vm);
    let (score, breakdown) = score_projected(&projected, weights);

    Some(DestinationScore {
        host: host.name.clone(),
        score,
        projected,
        breakdown,
    })
}

/// Score all candidate hosts and return a sorted list (best first).
///
/// Equal scores are ordered by host name so results are reproducible.
pub fn rank_destinations<'a>(
    hosts: impl IntoIterator<Item = &'a SimulatedHostState>,
    vm: &Vm,
    min_free: &MinFreeThresholds,
    weights: &ScoringWeights,
) -> Vec<DestinationScore> {
    let mut scores: Vec<DestinationScore> = hosts
        .into_iter()
        .filter_map(|h| score_destination(h, vm, min_free, weights))
        .collect();
    scores.sort_by(by_score_then_name);
    scores
}

/// Descending score, ascending host name.
pub fn by_score_then_name(a: &DestinationScore, b: &DestinationScore) -> Ordering {
    b.score.total_cmp(&a.score).then_with(|| a.host.cmp(&b.host))
}

/// How much of its current host a VM occupies, weighted like the
/// utilization score. Used to rank VMs from smallest to largest.
pub fn resource_footprint(vm: &Vm, host: &ResourceState, weights: &ScoringWeights) -> f64 {
    let cpu = if vm.is_running() {
        ratio(vm.cpu_load_cores(), f64::from(host.cores))
    } else {
        0.0
    };
    let ram = ratio(vm.ram_bytes as f64, host.ram_total as f64);
    let storage = ratio(vm.effective_disk() as f64, host.storage_total as f64);
    weights.cpu * cpu + weights.ram * ram + weights.storage * storage
}

fn ratio(part: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    part / total * 100.0
}

//! Plan assembly.
//!
//! Every planner hands its suggestions to [`build_plan`], which projects
//! the before/after state of each involved host from the original
//! snapshot and summarizes the effect on RAM balance over the hosts the
//! request left in scope.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use vmplan_core::{
    ClusterMetrics, ClusterSnapshot, Host, HostName, ResourceState, Vm, apply_delta,
    compute_state,
};

use crate::balance::BalanceSummary;
use crate::suggestion::{MigrationSuggestion, UnplacedVm};

/// Before/after state of one host touched by the plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostImpact {
    pub host: HostName,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// Resources moved by the plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MoveTotals {
    pub vms: usize,
    pub vcpus: u64,
    pub ram_bytes: u64,
    pub storage_bytes: u64,
}

/// Standard deviation of host RAM% around the cluster average, before and
/// after the plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Improvement {
    pub before_stddev: f64,
    pub after_stddev: f64,
    /// Reduction of the standard deviation in percent; negative when
    /// balance gets worse.
    pub percent: f64,
}

impl Improvement {
    pub fn new(before_stddev: f64, after_stddev: f64) -> Self {
        let percent = if before_stddev > 0.0 {
            (before_stddev - after_stddev) / before_stddev * 100.0
        } else {
            0.0
        };
        Self {
            before_stddev,
            after_stddev,
            percent,
        }
    }

    pub fn describe(&self) -> String {
        let verb = if self.percent > 0.005 {
            "improved"
        } else if self.percent < -0.005 {
            "worsened"
        } else {
            return format!(
                "RAM balance unchanged (std-dev {:.2} points)",
                self.before_stddev
            );
        };
        format!(
            "RAM balance {verb} by {:.1}% (std-dev {:.2} -> {:.2} points)",
            self.percent.abs(),
            self.before_stddev,
            self.after_stddev
        )
    }
}

/// The uniform output of every planning mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationPlan {
    /// Selection mode that produced the plan.
    pub mode: String,
    pub suggestions: Vec<MigrationSuggestion>,
    pub unplaced: Vec<UnplacedVm>,
    /// Involved hosts, by name.
    pub host_states: Vec<HostImpact>,
    pub totals: MoveTotals,
    pub improvement: Improvement,
    pub improvement_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<BalanceSummary>,
    pub anomalies: Vec<String>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.suggestions.is_empty()
    }
}

/// Assemble a plan from planner output.
pub fn build_plan(
    snapshot: &ClusterSnapshot,
    excluded: &HashSet<HostName>,
    mode: &str,
    suggestions: Vec<MigrationSuggestion>,
    unplaced: Vec<UnplacedVm>,
    balance: Option<BalanceSummary>,
    anomalies: Vec<String>,
) -> MigrationPlan {
    let placed: Vec<&MigrationSuggestion> = suggestions.iter().filter(|s| s.is_placed()).collect();

    let mut added: BTreeMap<&str, Vec<Vm>> = BTreeMap::new();
    let mut removed: BTreeMap<&str, Vec<Vm>> = BTreeMap::new();
    let mut totals = MoveTotals::default();
    for s in &placed {
        added.entry(s.target.as_str()).or_default().push(s.vm.clone());
        removed.entry(s.source.as_str()).or_default().push(s.vm.clone());
        totals.vms += 1;
        totals.vcpus += u64::from(s.vm.vcpus);
        totals.ram_bytes += s.vm.ram_bytes;
        totals.storage_bytes += s.vm.effective_disk();
    }

    let project = |host: &Host| {
        let before = compute_state(host);
        let name = host.name.as_str();
        let after = apply_delta(
            &before,
            added.get(name).map_or(&[][..], Vec::as_slice),
            removed.get(name).map_or(&[][..], Vec::as_slice),
        );
        (before, after)
    };

    let involved: BTreeSet<&str> = added.keys().chain(removed.keys()).copied().collect();
    let host_states = involved
        .into_iter()
        .filter_map(|name| snapshot.host(name))
        .map(|host| {
            let (before, after) = project(host);
            HostImpact {
                host: host.name.clone(),
                before,
                after,
            }
        })
        .collect();

    let (before_states, after_states): (Vec<_>, Vec<_>) = snapshot
        .eligible_hosts()
        .filter(|h| !excluded.contains(&h.name))
        .map(project)
        .unzip();
    let improvement = Improvement::new(
        ram_deviation_stddev(&before_states),
        ram_deviation_stddev(&after_states),
    );

    MigrationPlan {
        mode: mode.to_string(),
        improvement_text: improvement.describe(),
        suggestions,
        unplaced,
        host_states,
        totals,
        improvement,
        balance,
        anomalies,
    }
}

/// Population standard deviation of host RAM% around the capacity-weighted
/// cluster average.
pub fn ram_deviation_stddev(states: &[ResourceState]) -> f64 {
    if states.is_empty() {
        return 0.0;
    }
    let avg = ClusterMetrics::from_states(states).avg_ram_percent();
    let variance = states
        .iter()
        .map(|s| (s.ram_percent() - avg).powi(2))
        .sum::<f64>()
        / states.len() as f64;
    variance.sqrt()
}

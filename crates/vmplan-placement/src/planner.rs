//! Planning entry point.
//!
//! [`Planner::plan`] validates the request, resolves effective disk sizes
//! on a private copy of the snapshot, dispatches to the single-source or
//! balance pipeline and assembles the [`MigrationPlan`].

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use vmplan_core::{
    ClusterSnapshot, DiskUsageLookup, MigrationConstraints, MigrationRequest, NoDiskUsage,
    PlanError, PlanResult, PlannerConfig, resolve_disk_usage,
};

use crate::balance::{BalanceEngine, BalanceOutcome, BalanceSummary};
use crate::result::{MigrationPlan, build_plan};
use crate::single_source::plan_single_source;
use crate::swap::SwapOptimizer;

pub struct Planner {
    config: PlannerConfig,
    disk_lookup: Arc<dyn DiskUsageLookup>,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            disk_lookup: Arc::new(NoDiskUsage),
        }
    }

    pub fn with_disk_lookup(mut self, lookup: Arc<dyn DiskUsageLookup>) -> Self {
        self.disk_lookup = lookup;
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Validate `request` and plan it against `snapshot`.
    pub fn plan(
        &self,
        snapshot: &ClusterSnapshot,
        request: &MigrationRequest,
    ) -> PlanResult<MigrationPlan> {
        let constraints = request.validate()?;
        self.plan_constraints(snapshot, &constraints)
    }

    /// Plan already-validated constraints.
    pub fn plan_constraints(
        &self,
        snapshot: &ClusterSnapshot,
        constraints: &MigrationConstraints,
    ) -> PlanResult<MigrationPlan> {
        if snapshot.hosts.is_empty() {
            return Err(PlanError::EmptyCluster);
        }
        let snapshot = resolve_disk_usage(snapshot, self.disk_lookup.as_ref());

        let plan = if constraints.mode.is_balance() {
            self.plan_balance(&snapshot, constraints)?
        } else {
            let outcome = plan_single_source(&snapshot, constraints, &self.config)?;
            build_plan(
                &snapshot,
                &constraints.exclude_hosts,
                constraints.mode.label(),
                outcome.suggestions,
                outcome.unplaced,
                None,
                Vec::new(),
            )
        };

        info!(
            mode = %plan.mode,
            suggestions = plan.suggestions.len(),
            unplaced = plan.unplaced.len(),
            improvement = %plan.improvement_text,
            "plan ready"
        );
        Ok(plan)
    }

    fn plan_balance(
        &self,
        snapshot: &ClusterSnapshot,
        constraints: &MigrationConstraints,
    ) -> PlanResult<MigrationPlan> {
        let run = BalanceEngine::new(&self.config.balance).run(snapshot, constraints)?;
        let migrations = run.suggestions.len();
        let mut suggestions = run.suggestions;
        let mut cluster = run.cluster;
        let mut consumed: HashSet<_> = run.moved;

        let mut swaps = 0;
        if self.config.swap.enabled {
            let total_vms = cluster.metrics().vm_count;
            let swap_run = SwapOptimizer::new(&self.config.swap, total_vms).run(&mut cluster, &mut consumed);
            swaps = swap_run.swaps;
            suggestions.extend(swap_run.suggestions);
        }

        if suggestions.is_empty() {
            return Err(PlanError::NoBeneficialPlan(
                "no migration improves cluster balance".to_string(),
            ));
        }

        let mut anomalies = Vec::new();
        if run.outcome == BalanceOutcome::IterationCap {
            let message = format!(
                "balancing stopped at the {}-iteration cap before converging",
                self.config.balance.max_iterations
            );
            warn!("{message}");
            anomalies.push(message);
        }

        let summary = BalanceSummary {
            outcome: run.outcome,
            iterations: run.iterations,
            migrations,
            swaps,
        };
        Ok(build_plan(
            snapshot,
            &constraints.exclude_hosts,
            constraints.mode.label(),
            suggestions,
            Vec::new(),
            Some(summary),
            anomalies,
        ))
    }
}

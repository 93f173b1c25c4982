//! Cluster balancing — greedy RAM-driven search over donor/receiver pairs.
//!
//! Each iteration classifies hosts against the cluster average, scores
//! every (donor VM, receiver) pair on a bounded worker pool, and applies
//! the single best move to the simulated cluster once all scoring jobs
//! have reported. Every job of one iteration reads the same immutable
//! snapshot; the winning move is applied on the control path only.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::channel;

use serde::Serialize;
use threadpool::ThreadPool;
use tracing::{debug, info, warn};

use vmplan_core::{
    BalanceConfig, ClusterMetrics, ClusterSnapshot, GIB, HostName, MigrationConstraints,
    MinFreeThresholds, PlanError, PlanResult, Vm, VmId, has_capacity,
};

use crate::simulation::{SimulatedCluster, SimulatedHostState};
use crate::suggestion::MigrationSuggestion;

/// Reductions at or below this are treated as no improvement.
const MIN_REDUCTION: f64 = 1e-9;

/// Why the balancing loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceOutcome {
    /// Every host is within tolerance of the cluster average.
    Converged,
    /// No remaining move improves balance.
    Exhausted,
    /// The iteration cap was hit while moves were still being found.
    IterationCap,
}

/// Summary attached to balance-mode plans.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSummary {
    pub outcome: BalanceOutcome,
    pub iterations: usize,
    pub migrations: usize,
    pub swaps: usize,
}

/// A host's deviation from the cluster average.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDeviation {
    pub host: HostName,
    pub composite: f64,
    pub vcpu: f64,
    pub ram: f64,
    /// Relative VM-count deviation, in percent of the average count.
    pub vm_count: f64,
}

/// Donors and receivers for one iteration.
#[derive(Debug, Clone, Default)]
pub struct HostClassification {
    /// Most overloaded first.
    pub donors: Vec<HostDeviation>,
    /// Most underloaded first.
    pub receivers: Vec<HostDeviation>,
}

impl HostClassification {
    pub fn is_actionable(&self) -> bool {
        !self.donors.is_empty() && !self.receivers.is_empty()
    }
}

/// Split hosts into donors and receivers by composite deviation.
pub fn classify_hosts(
    cluster: &SimulatedCluster,
    metrics: &ClusterMetrics,
    config: &BalanceConfig,
) -> HostClassification {
    let avg_vcpu = metrics.avg_vcpu_percent();
    let avg_ram = metrics.avg_ram_percent();
    let avg_count = metrics.avg_vm_count();

    let mut classification = HostClassification::default();
    for host in cluster.hosts() {
        let state = host.state();
        let vcpu = state.vcpu_percent() - avg_vcpu;
        let ram = state.ram_percent() - avg_ram;
        let vm_count = if avg_count > 0.0 {
            (state.vm_count as f64 - avg_count) / avg_count * 100.0
        } else {
            0.0
        };
        let composite =
            config.vcpu_weight * vcpu + config.ram_weight * ram + config.vm_count_weight * vm_count;

        let deviation = HostDeviation {
            host: host.name.clone(),
            composite,
            vcpu,
            ram,
            vm_count,
        };
        if composite > config.donor_threshold {
            classification.donors.push(deviation);
        } else if composite < -config.donor_threshold {
            classification.receivers.push(deviation);
        }
    }

    classification.donors.sort_by(|a, b| {
        b.composite
            .total_cmp(&a.composite)
            .then_with(|| a.host.cmp(&b.host))
    });
    classification.receivers.sort_by(|a, b| {
        a.composite
            .total_cmp(&b.composite)
            .then_with(|| a.host.cmp(&b.host))
    });
    classification
}

/// One scored (VM, donor, receiver) move.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceCandidate {
    pub vm_id: VmId,
    pub donor: HostName,
    pub receiver: HostName,
    pub score: f64,
    /// Drop in combined donor + receiver RAM% deviation, in points.
    pub reduction: f64,
}

/// Best first: higher score, then receiver name, then VM id.
fn by_rank(a: &BalanceCandidate, b: &BalanceCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.receiver.cmp(&b.receiver))
        .then_with(|| a.vm_id.cmp(&b.vm_id))
}

/// Inputs that stay fixed for a whole balancing run.
#[derive(Debug, Clone)]
pub struct BalanceRules {
    pub config: BalanceConfig,
    pub min_free: MinFreeThresholds,
    pub max_vms_per_host: Option<usize>,
    pub metrics: ClusterMetrics,
}

/// Score moving `vm` from `donor` to `receiver`. `None` means the receiver
/// must not take the VM or the move does not reduce imbalance.
pub fn evaluate_candidate(
    rules: &BalanceRules,
    vm: &Vm,
    donor: &SimulatedHostState,
    receiver: &SimulatedHostState,
    received: usize,
) -> Option<BalanceCandidate> {
    let cfg = &rules.config;
    let metrics = &rules.metrics;

    if rules.max_vms_per_host.is_some_and(|max| received >= max) {
        return None;
    }
    if !has_capacity(receiver.state(), vm, &rules.min_free) {
        return None;
    }

    let before = receiver.state();
    let after = receiver.projected_with(vm);

    if after.cpu_percent() > cfg.cpu_cap
        || after.ram_percent() > cfg.ram_cap
        || after.storage_percent() > cfg.storage_cap
    {
        return None;
    }

    let near_average = [
        (before.ram_percent(), after.ram_percent(), metrics.avg_ram_percent()),
        (before.vcpu_percent(), after.vcpu_percent(), metrics.avg_vcpu_percent()),
        (
            before.storage_percent(),
            after.storage_percent(),
            metrics.avg_storage_percent(),
        ),
    ];
    for (was, will_be, avg) in near_average {
        if (was - avg).abs() <= cfg.near_average_band && will_be > avg + cfg.near_average_ceiling {
            return None;
        }
    }

    let largest = receiver.largest_disk().max(vm.effective_disk());
    let headroom = cfg.headroom_floor_gib as f64 * GIB as f64 + cfg.headroom_fraction * largest as f64;
    if (after.storage_free() as f64) < headroom {
        return None;
    }

    let avg_ram = metrics.avg_ram_percent();
    let donor_after = donor.projected_without(vm);
    let deviation_before =
        (donor.state().ram_percent() - avg_ram).abs() + (before.ram_percent() - avg_ram).abs();
    let deviation_after =
        (donor_after.ram_percent() - avg_ram).abs() + (after.ram_percent() - avg_ram).abs();
    let reduction = deviation_before - deviation_after;
    if reduction <= MIN_REDUCTION {
        return None;
    }

    let disk_gib = vm.effective_disk_gib().max(1.0);
    let score = cfg.improvement_weight * reduction + cfg.size_bonus / disk_gib;

    Some(BalanceCandidate {
        vm_id: vm.id,
        donor: donor.name.clone(),
        receiver: receiver.name.clone(),
        score,
        reduction,
    })
}

/// Every host within tolerance of average RAM% and vCPU%.
fn is_converged(cluster: &SimulatedCluster, metrics: &ClusterMetrics, tolerance: f64) -> bool {
    let avg_ram = metrics.avg_ram_percent();
    let avg_vcpu = metrics.avg_vcpu_percent();
    cluster.hosts().all(|h| {
        (h.state().ram_percent() - avg_ram).abs() <= tolerance
            && (h.state().vcpu_percent() - avg_vcpu).abs() <= tolerance
    })
}

/// State shared read-only by the scoring jobs of one iteration.
struct IterationSnapshot {
    cluster: Arc<SimulatedCluster>,
    rules: Arc<BalanceRules>,
    receivers: Vec<HostName>,
    received: HashMap<HostName, usize>,
}

impl IterationSnapshot {
    /// Best receiver for one donor VM.
    fn best_for(&self, donor: &str, vm_id: VmId) -> Option<BalanceCandidate> {
        let donor = self.cluster.get(donor)?;
        let vm = donor.vms.get(&vm_id)?;
        self.receivers
            .iter()
            .filter_map(|name| self.cluster.get(name))
            .filter_map(|receiver| {
                let received = self.received.get(&receiver.name).copied().unwrap_or(0);
                evaluate_candidate(&self.rules, vm, donor, receiver, received)
            })
            .min_by(by_rank)
    }
}

/// Result of a balancing run.
#[derive(Debug, Clone)]
pub struct BalanceRun {
    /// Simulated cluster after every accepted move.
    pub cluster: SimulatedCluster,
    pub suggestions: Vec<MigrationSuggestion>,
    /// VMs moved by this run.
    pub moved: HashSet<VmId>,
    pub outcome: BalanceOutcome,
    pub iterations: usize,
}

/// Greedy cluster balancer.
pub struct BalanceEngine {
    config: BalanceConfig,
}

impl BalanceEngine {
    pub fn new(config: &BalanceConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Balance the online, non-excluded hosts of `snapshot`.
    pub fn run(
        &self,
        snapshot: &ClusterSnapshot,
        constraints: &MigrationConstraints,
    ) -> PlanResult<BalanceRun> {
        let eligible: Vec<_> = snapshot
            .eligible_hosts()
            .filter(|h| !constraints.is_excluded(&h.name))
            .collect();
        if eligible.len() < 2 {
            return Err(PlanError::InsufficientNodes {
                eligible: eligible.len(),
            });
        }

        let mut cluster = Arc::new(SimulatedCluster::from_hosts(eligible.iter().copied()));
        let metrics = cluster.metrics();
        info!(
            hosts = metrics.host_count,
            vms = metrics.vm_count,
            avg_ram = metrics.avg_ram_percent(),
            avg_vcpu = metrics.avg_vcpu_percent(),
            "balancing cluster"
        );

        let initial = classify_hosts(&cluster, &metrics, &self.config);
        for d in &initial.donors {
            debug!(host = %d.host, composite = d.composite, ram = d.ram, vcpu = d.vcpu, "donor");
        }
        for r in &initial.receivers {
            debug!(host = %r.host, composite = r.composite, ram = r.ram, vcpu = r.vcpu, "receiver");
        }
        if !initial.is_actionable() {
            return Err(PlanError::NoBeneficialPlan("already balanced".to_string()));
        }

        let rules = Arc::new(BalanceRules {
            config: self.config.clone(),
            min_free: constraints.min_free.clone(),
            max_vms_per_host: constraints.max_vms_per_host,
            metrics: metrics.clone(),
        });
        let pool = ThreadPool::new(self.config.workers.max(1));

        let mut received: HashMap<HostName, usize> = HashMap::new();
        let mut moved: HashSet<VmId> = HashSet::new();
        let mut suggestions = Vec::new();
        let mut outcome = BalanceOutcome::IterationCap;
        let mut iterations = 0;

        for _ in 0..self.config.max_iterations {
            if is_converged(&cluster, &metrics, self.config.convergence_tolerance) {
                outcome = BalanceOutcome::Converged;
                break;
            }
            iterations += 1;

            let classification = classify_hosts(&cluster, &metrics, &self.config);
            let Some(best) =
                self.best_candidate(&pool, &cluster, &rules, &classification, &received, &moved)
            else {
                outcome = BalanceOutcome::Exhausted;
                break;
            };

            let Some(suggestion) = apply_move(Arc::make_mut(&mut cluster), &best) else {
                warn!(vm = best.vm_id, donor = %best.donor, receiver = %best.receiver, "move could not be applied");
                outcome = BalanceOutcome::Exhausted;
                break;
            };
            debug!(
                iteration = iterations,
                vm = best.vm_id,
                donor = %best.donor,
                receiver = %best.receiver,
                score = best.score,
                "accepted move"
            );
            *received.entry(best.receiver.clone()).or_insert(0) += 1;
            moved.insert(best.vm_id);
            suggestions.push(suggestion);
        }

        if outcome == BalanceOutcome::IterationCap
            && is_converged(&cluster, &metrics, self.config.convergence_tolerance)
        {
            outcome = BalanceOutcome::Converged;
        }
        if outcome == BalanceOutcome::IterationCap {
            warn!(
                max_iterations = self.config.max_iterations,
                migrations = suggestions.len(),
                "balancing stopped at the iteration cap"
            );
        }

        info!(?outcome, iterations, migrations = suggestions.len(), "balancing finished");
        let cluster = Arc::try_unwrap(cluster).unwrap_or_else(|shared| (*shared).clone());
        Ok(BalanceRun {
            cluster,
            suggestions,
            moved,
            outcome,
            iterations,
        })
    }

    /// Score every donor VM against every receiver on the pool and return
    /// the best candidate once all jobs have reported.
    fn best_candidate(
        &self,
        pool: &ThreadPool,
        cluster: &Arc<SimulatedCluster>,
        rules: &Arc<BalanceRules>,
        classification: &HostClassification,
        received: &HashMap<HostName, usize>,
        moved: &HashSet<VmId>,
    ) -> Option<BalanceCandidate> {
        if !classification.is_actionable() {
            return None;
        }

        let jobs: Vec<(HostName, VmId)> = classification
            .donors
            .iter()
            .filter_map(|d| cluster.get(&d.host))
            .flat_map(|donor| {
                donor
                    .vms
                    .values()
                    .filter(move |vm| vm.is_running() && vm.migratable && !moved.contains(&vm.id))
                    .map(move |vm| (donor.name.clone(), vm.id))
            })
            .collect();
        if jobs.is_empty() {
            return None;
        }

        let snapshot = Arc::new(IterationSnapshot {
            cluster: Arc::clone(cluster),
            rules: Arc::clone(rules),
            receivers: classification.receivers.iter().map(|r| r.host.clone()).collect(),
            received: received.clone(),
        });

        let n_jobs = jobs.len();
        let (tx, rx) = channel();
        for (donor, vm_id) in jobs {
            let tx = tx.clone();
            let snapshot = Arc::clone(&snapshot);
            pool.execute(move || {
                let _ = tx.send(snapshot.best_for(&donor, vm_id));
            });
        }
        drop(tx);
        drop(snapshot);

        let results: Vec<Option<BalanceCandidate>> = rx.iter().take(n_jobs).collect();
        pool.join();
        if results.len() < n_jobs {
            warn!(expected = n_jobs, received = results.len(), "scoring jobs failed");
        }

        results.into_iter().flatten().min_by(by_rank)
    }
}

fn apply_move(cluster: &mut SimulatedCluster, best: &BalanceCandidate) -> Option<MigrationSuggestion> {
    let donor = cluster.get(&best.donor)?;
    let receiver = cluster.get(&best.receiver)?;
    let vm = donor.vms.get(&best.vm_id)?.clone();
    let (donor_cores, receiver_cores) = (donor.cores(), receiver.cores());
    let (donor_before, receiver_before) = (donor.state().ram_percent(), receiver.state().ram_percent());

    cluster.move_vm(best.vm_id, &best.donor, &best.receiver)?;

    let donor_after = cluster.get(&best.donor).map_or(0.0, |h| h.state().ram_percent());
    let receiver_after = cluster.get(&best.receiver).map_or(0.0, |h| h.state().ram_percent());
    let reason = format!(
        "balance: RAM deviation -{:.1} pts ({} {:.1}% -> {:.1}%, {} {:.1}% -> {:.1}%)",
        best.reduction,
        best.donor,
        donor_before,
        donor_after,
        best.receiver,
        receiver_before,
        receiver_after
    );
    Some(MigrationSuggestion::new(
        &vm,
        &best.donor,
        donor_cores,
        &best.receiver,
        receiver_cores,
        best.score,
        reason,
    ))
}

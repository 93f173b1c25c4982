//! Parallel migrate-all planning.
//!
//! Evacuating a host places every VM on it. VMs are placed largest
//! first by a bounded pool of workers that pull VM indices from a shared
//! counter. Destination state lives in a lock table:
//!
//! ```text
//! LockTable
//!   ├── hosts:   host → Mutex<SimulatedHostState>   (one lock per destination)
//!   └── planned: Mutex<host → VMs planned so far>   (coarse)
//! ```
//!
//! A worker holds at most one of these locks at any time. Scoring reads
//! each destination under its own lock and releases it before moving on,
//! so two workers may score against a state the other is about to
//! change. The commit step re-checks capacity under the destination lock,
//! which keeps every accepted placement within capacity; only the choice
//! among valid destinations depends on timing. One worker plans serially
//! and deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use threadpool::ThreadPool;
use tracing::{debug, warn};

use vmplan_core::{
    Host, HostName, MinFreeThresholds, SingleSourceConfig, Vm, compute_state, has_capacity,
};

use crate::scorer::score_destination;
use crate::simulation::SimulatedHostState;
use crate::single_source::{PlacementRules, describe_choice, no_capacity_reason};
use crate::suggestion::MigrationSuggestion;

/// Cluster-wide utilization the destinations would reach if the source's
/// VMs were spread perfectly evenly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterTarget {
    pub cpu_percent: f64,
    pub ram_percent: f64,
}

impl ClusterTarget {
    pub fn compute(destinations: &[&Host], vms: &[Vm]) -> Self {
        let states: Vec<_> = destinations
            .iter()
            .map(|h| compute_state(h))
            .collect();
        let cores: f64 = states.iter().map(|s| f64::from(s.cores)).sum();
        let cpu_used: f64 = states.iter().map(|s| s.cpu_used_cores).sum::<f64>()
            + vms.iter().filter(|vm| vm.is_running()).map(Vm::cpu_load_cores).sum::<f64>();
        let ram_total: f64 = states.iter().map(|s| s.ram_total as f64).sum();
        let ram_used: f64 = states.iter().map(|s| s.ram_used as f64).sum::<f64>()
            + vms
                .iter()
                .filter(|vm| vm.is_running())
                .map(|vm| vm.ram_bytes as f64)
                .sum::<f64>();

        Self {
            cpu_percent: if cores > 0.0 { cpu_used / cores * 100.0 } else { 0.0 },
            ram_percent: if ram_total > 0.0 { ram_used / ram_total * 100.0 } else { 0.0 },
        }
    }
}

/// Per-destination simulated state plus the coarse planned-count map.
struct LockTable {
    hosts: BTreeMap<HostName, Mutex<SimulatedHostState>>,
    planned: Mutex<HashMap<HostName, usize>>,
}

impl LockTable {
    fn new(destinations: &[&Host]) -> Self {
        Self {
            hosts: destinations
                .iter()
                .map(|h| (h.name.clone(), Mutex::new(SimulatedHostState::from_host(h))))
                .collect(),
            planned: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve one slot on `host` if it is below the per-host limit.
    fn reserve(&self, host: &str, rules: &PlacementRules) -> bool {
        let mut planned = lock(&self.planned);
        let count = planned.entry(host.to_string()).or_insert(0);
        if !rules.below_vm_limit(*count) {
            return false;
        }
        *count += 1;
        true
    }

    fn release(&self, host: &str) {
        let mut planned = lock(&self.planned);
        if let Some(count) = planned.get_mut(host) {
            *count = count.saturating_sub(1);
        }
    }

    fn has_room(&self, host: &str, rules: &PlacementRules) -> bool {
        let planned = lock(&self.planned);
        rules.below_vm_limit(planned.get(host).copied().unwrap_or(0))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A destination worth trying, in preference order.
struct Candidate {
    host: HostName,
    score: f64,
    /// Within the cluster-target band; otherwise a least-loaded fallback.
    in_band: bool,
}

/// Result of placing one VM.
enum Placement {
    Placed {
        target: HostName,
        target_cores: u32,
        score: f64,
        reason: String,
    },
    Unplaced(String),
}

struct Shared {
    table: LockTable,
    vms: Vec<Vm>,
    next: AtomicUsize,
    rules: PlacementRules,
    target: ClusterTarget,
    band: f64,
}

/// Place every VM of the source on the destinations.
///
/// Returns one suggestion per VM in input order; VMs without a
/// destination carry the sentinel target.
pub fn plan_migrate_all_parallel(
    source: &SimulatedHostState,
    destinations: &[&Host],
    vms: Vec<Vm>,
    rules: &PlacementRules,
    config: &SingleSourceConfig,
) -> Vec<MigrationSuggestion> {
    let len = vms.len();
    if len == 0 {
        return Vec::new();
    }

    let target = ClusterTarget::compute(destinations, &vms);
    let n_workers = config.workers.max(1).min(len);
    debug!(
        vms = len,
        workers = n_workers,
        target_cpu = target.cpu_percent,
        target_ram = target.ram_percent,
        "planning migrate-all"
    );

    let shared = Arc::new(Shared {
        table: LockTable::new(destinations),
        vms,
        next: AtomicUsize::new(0),
        rules: rules.clone(),
        target,
        band: config.target_band,
    });

    let pool = ThreadPool::new(n_workers);
    let (tx, rx) = channel();
    for _ in 0..n_workers {
        let tx = tx.clone();
        let shared = shared.clone();
        pool.execute(move || {
            loop {
                let idx = shared.next.fetch_add(1, Ordering::SeqCst);
                if idx >= shared.vms.len() {
                    break;
                }
                let placement = place_one(&shared, &shared.vms[idx]);
                if tx.send((idx, placement)).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let results: Vec<(usize, Placement)> = rx.iter().take(len).collect();
    pool.join();

    let mut by_index: Vec<Option<Placement>> = (0..len).map(|_| None).collect();
    for (idx, placement) in results {
        by_index[idx] = Some(placement);
    }

    shared
        .vms
        .iter()
        .zip(by_index)
        .map(|(vm, placement)| match placement {
            Some(Placement::Placed {
                target,
                target_cores,
                score,
                reason,
            }) => MigrationSuggestion::new(
                vm,
                &source.name,
                source.cores(),
                &target,
                target_cores,
                score,
                reason,
            ),
            Some(Placement::Unplaced(reason)) => {
                MigrationSuggestion::unplaced(vm, &source.name, source.cores(), reason)
            }
            None => {
                warn!(vm = vm.id, "planning worker exited before placing VM");
                MigrationSuggestion::unplaced(
                    vm,
                    &source.name,
                    source.cores(),
                    "planning worker failed",
                )
            }
        })
        .collect()
}

fn place_one(shared: &Shared, vm: &Vm) -> Placement {
    let candidates = rank_candidates(shared, vm);
    let raw = MinFreeThresholds::default();

    for candidate in candidates {
        let Some(slot) = shared.table.hosts.get(&candidate.host) else {
            continue;
        };
        if !shared.table.reserve(&candidate.host, &shared.rules) {
            continue;
        }

        let committed = {
            let mut host = lock(slot);
            let min_free = if candidate.in_band { &shared.rules.min_free } else { &raw };
            score_destination(&host, vm, min_free, &shared.rules.weights).map(|best| {
                let mut reason = describe_choice(Some(&*host), &best);
                if !candidate.in_band {
                    reason = format!("fallback to least-loaded host, cluster target exceeded; {reason}");
                }
                let target_cores = host.cores();
                host.add_vm(vm.clone());
                Placement::Placed {
                    target: best.host,
                    target_cores,
                    score: best.score,
                    reason,
                }
            })
        };

        match committed {
            Some(placement) => {
                debug!(vm = vm.id, target = %candidate.host, in_band = candidate.in_band, "placed");
                return placement;
            }
            None => shared.table.release(&candidate.host),
        }
    }

    Placement::Unplaced(no_capacity_reason(vm))
}

/// Destinations in preference order: those that stay within the cluster
/// target band by score, then every host with raw capacity from least to
/// most loaded. Each destination is read under its own lock, one at a time.
fn rank_candidates(shared: &Shared, vm: &Vm) -> Vec<Candidate> {
    let raw = MinFreeThresholds::default();
    let weights = &shared.rules.weights;
    let mut in_band: Vec<Candidate> = Vec::new();
    let mut fallback: Vec<(f64, Candidate)> = Vec::new();

    for (name, slot) in &shared.table.hosts {
        if !shared.table.has_room(name, &shared.rules) {
            continue;
        }
        let host = lock(slot);

        if let Some(scored) = score_destination(&host, vm, &shared.rules.min_free, weights) {
            let within = scored.projected.cpu_percent() <= shared.target.cpu_percent + shared.band
                && scored.projected.ram_percent() <= shared.target.ram_percent + shared.band;
            if within {
                in_band.push(Candidate {
                    host: name.clone(),
                    score: scored.score,
                    in_band: true,
                });
                continue;
            }
        }

        if has_capacity(host.state(), vm, &raw) {
            let load = host.state().utilization_score(weights);
            fallback.push((
                load,
                Candidate {
                    host: name.clone(),
                    score: 0.0,
                    in_band: false,
                },
            ));
        }
    }

    in_band.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.host.cmp(&b.host)));
    fallback.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.host.cmp(&b.1.host)));

    in_band
        .into_iter()
        .chain(fallback.into_iter().map(|(_, c)| c))
        .collect()
}

//! Post-balance swap optimizer.
//!
//! The balance engine is driven by RAM and can leave vCPU allocation or
//! VM counts uneven. This pass trades VMs between hosts so RAM stays
//! roughly where it is while vCPUs or VM counts even out:
//!
//! - `one_for_one`: a high-vCPU VM on a vCPU-heavy host for a
//!   similar-RAM, lower-vCPU VM on a vCPU-light host
//! - `one_for_many`: one large VM on an under-populated host for two or
//!   three smaller VMs from an over-populated host
//!
//! Swaps are checked for RAM similarity and vCPU reduction only. Capacity
//! caps and storage headroom are not re-validated.

use std::collections::HashSet;

use tracing::{debug, info};

use vmplan_core::{GIB, HostName, SwapConfig, Vm, VmId};

use crate::simulation::SimulatedCluster;
use crate::suggestion::{MigrationSuggestion, MoveKind};

/// Swaps found by one optimizer run.
#[derive(Debug, Clone, Default)]
pub struct SwapRun {
    pub suggestions: Vec<MigrationSuggestion>,
    /// Number of trades; each trade has two or more legs.
    pub swaps: usize,
}

pub struct SwapOptimizer<'a> {
    config: &'a SwapConfig,
    budget: usize,
    next_group: u32,
}

impl<'a> SwapOptimizer<'a> {
    pub fn new(config: &'a SwapConfig, total_vms: usize) -> Self {
        let per = config.vms_per_swap_budget.max(1);
        let budget = (total_vms / per).clamp(config.min_budget, config.max_budget.max(config.min_budget));
        Self {
            config,
            budget,
            next_group: 1,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Run both passes over `cluster`. VMs in `consumed` are left alone,
    /// and every VM this run moves is added to it.
    pub fn run(&mut self, cluster: &mut SimulatedCluster, consumed: &mut HashSet<VmId>) -> SwapRun {
        let mut run = SwapRun::default();
        self.one_for_one(cluster, consumed, &mut run);
        self.one_for_many(cluster, consumed, &mut run);
        info!(swaps = run.swaps, legs = run.suggestions.len(), budget = self.budget, "swap pass finished");
        run
    }

    /// Pass 1: 1-for-1 vCPU swaps between vCPU-heavy and vCPU-light hosts.
    pub fn one_for_one(
        &mut self,
        cluster: &mut SimulatedCluster,
        consumed: &mut HashSet<VmId>,
        run: &mut SwapRun,
    ) {
        let avg = cluster.metrics().avg_vcpu_percent();
        let threshold = self.config.vcpu_threshold;

        let mut heavy: Vec<(HostName, f64)> = cluster
            .hosts()
            .map(|h| (h.name.clone(), h.state().vcpu_percent()))
            .filter(|(_, pct)| *pct >= avg + threshold)
            .collect();
        heavy.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        for (host, _) in heavy {
            if run.swaps >= self.budget {
                return;
            }
            let Some(state) = cluster.get(&host) else {
                continue;
            };
            let mut candidates: Vec<Vm> = state
                .vms
                .values()
                .filter(|vm| swappable(vm, consumed) && vm.vcpus >= 2)
                .cloned()
                .collect();
            candidates.sort_by(|a, b| b.vcpus.cmp(&a.vcpus).then(a.id.cmp(&b.id)));

            for vm in candidates {
                if run.swaps >= self.budget {
                    return;
                }
                let still_heavy = cluster
                    .get(&host)
                    .is_some_and(|h| h.state().vcpu_percent() >= avg + threshold);
                if !still_heavy {
                    break;
                }

                let Some((partner_host, partner)) =
                    self.find_partner(cluster, &host, &vm, avg, consumed)
                else {
                    continue;
                };

                let group = self.next_group();
                let reason = format!(
                    "swap: {} vCPU for {} vCPU at similar RAM ({:.1} / {:.1} GiB)",
                    vm.vcpus,
                    partner.vcpus,
                    vm.ram_gib(),
                    partner.ram_gib()
                );
                let score = f64::from(vm.vcpus - partner.vcpus);
                let legs = [(&vm, host.as_str(), partner_host.as_str()), (&partner, partner_host.as_str(), host.as_str())];
                if let Some(moves) = apply_legs(cluster, &legs, score, &reason, MoveKind::Swap, group) {
                    consumed.insert(vm.id);
                    consumed.insert(partner.id);
                    debug!(vm = vm.id, partner = partner.id, %host, %partner_host, "1-for-1 swap");
                    run.suggestions.extend(moves);
                    run.swaps += 1;
                }
            }
        }
    }

    /// Closest-RAM, lower-vCPU VM on a vCPU-light host.
    fn find_partner(
        &self,
        cluster: &SimulatedCluster,
        host: &str,
        vm: &Vm,
        avg: f64,
        consumed: &HashSet<VmId>,
    ) -> Option<(HostName, Vm)> {
        let tolerance = (self.config.ram_tolerance_fraction * vm.ram_bytes as f64)
            .max((self.config.ram_tolerance_floor_gib * GIB) as f64);

        cluster
            .hosts()
            .filter(|h| h.name != host && h.state().vcpu_percent() <= avg - self.config.vcpu_threshold)
            .flat_map(|h| h.vms.values().map(move |p| (&h.name, p)))
            .filter(|(_, p)| swappable(p, consumed) && p.vcpus < vm.vcpus)
            .map(|(h, p)| (h, p, vm.ram_bytes.abs_diff(p.ram_bytes)))
            .filter(|(_, _, diff)| *diff as f64 <= tolerance)
            .min_by(|a, b| {
                a.2.cmp(&b.2)
                    .then(a.1.vcpus.cmp(&b.1.vcpus))
                    .then_with(|| a.0.cmp(b.0))
                    .then(a.1.id.cmp(&b.1.id))
            })
            .map(|(h, p, _)| (h.clone(), p.clone()))
    }

    /// Pass 2: trade one large VM for two or three small ones to even out
    /// VM counts.
    pub fn one_for_many(
        &mut self,
        cluster: &mut SimulatedCluster,
        consumed: &mut HashSet<VmId>,
        run: &mut SwapRun,
    ) {
        let avg = cluster.metrics().avg_vm_count();
        let imbalance = self.config.count_imbalance;

        let mut crowded: Vec<(HostName, usize)> = cluster
            .hosts()
            .map(|h| (h.name.clone(), h.state().vm_count))
            .filter(|(_, n)| *n as f64 >= avg + imbalance)
            .collect();
        crowded.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let mut sparse: Vec<(HostName, usize)> = cluster
            .hosts()
            .map(|h| (h.name.clone(), h.state().vm_count))
            .filter(|(_, n)| *n as f64 <= avg - imbalance)
            .collect();
        sparse.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        for (over, _) in &crowded {
            for (under, _) in &sparse {
                if run.swaps >= self.budget {
                    return;
                }
                let count = |name: &str| cluster.get(name).map_or(0, |h| h.state().vm_count) as f64;
                if count(over) < avg + imbalance || count(under) > avg - imbalance {
                    continue;
                }
                let Some((large, smalls)) = self.find_trade(cluster, over, under, consumed) else {
                    continue;
                };

                let group = self.next_group();
                let small_ram: u64 = smalls.iter().map(|vm| vm.ram_bytes).sum();
                let reason = format!(
                    "multi-swap: 1 VM ({:.1} GiB) for {} VMs ({:.1} GiB) to even VM counts",
                    large.ram_gib(),
                    smalls.len(),
                    small_ram as f64 / GIB as f64
                );
                let score = (smalls.len() - 1) as f64;
                let mut legs = vec![(&large, under.as_str(), over.as_str())];
                legs.extend(smalls.iter().map(|vm| (vm, over.as_str(), under.as_str())));

                if let Some(moves) = apply_legs(cluster, &legs, score, &reason, MoveKind::MultiSwap, group) {
                    consumed.insert(large.id);
                    consumed.extend(smalls.iter().map(|vm| vm.id));
                    debug!(large = large.id, smalls = smalls.len(), %over, %under, "one-for-many swap");
                    run.suggestions.extend(moves);
                    run.swaps += 1;
                }
            }
        }
    }

    /// First combination of 2 or 3 small VMs on `over` matching a large VM
    /// on `under`. The search stops after `max_combinations` tries.
    fn find_trade(
        &self,
        cluster: &SimulatedCluster,
        over: &str,
        under: &str,
        consumed: &HashSet<VmId>,
    ) -> Option<(Vm, Vec<Vm>)> {
        let over_host = cluster.get(over)?;
        let under_host = cluster.get(under)?;

        let mut large: Vec<&Vm> = under_host
            .vms
            .values()
            .filter(|vm| swappable(vm, consumed) && vm.ram_bytes >= self.config.large_vm_ram_gib * GIB)
            .collect();
        large.sort_by(|a, b| b.ram_bytes.cmp(&a.ram_bytes).then(a.id.cmp(&b.id)));

        let mut tried = 0usize;
        for big in large {
            let mut small: Vec<&Vm> = over_host
                .vms
                .values()
                .filter(|vm| swappable(vm, consumed) && vm.ram_bytes < big.ram_bytes)
                .collect();
            small.sort_by(|a, b| a.ram_bytes.cmp(&b.ram_bytes).then(a.id.cmp(&b.id)));
            small.truncate(self.config.max_small_candidates);

            let fits = |combo: &[&Vm]| {
                let ram: u64 = combo.iter().map(|vm| vm.ram_bytes).sum();
                let vcpus: u32 = combo.iter().map(|vm| vm.vcpus).sum();
                (ram.abs_diff(big.ram_bytes) as f64) <= self.config.multi_ram_tolerance * big.ram_bytes as f64
                    && vcpus < big.vcpus
            };

            let n = small.len();
            for i in 0..n {
                for j in i + 1..n {
                    tried += 1;
                    if tried > self.config.max_combinations {
                        return None;
                    }
                    let pair = [small[i], small[j]];
                    if fits(&pair) {
                        return Some((big.clone(), pair.iter().map(|vm| (*vm).clone()).collect()));
                    }
                }
            }
            for i in 0..n {
                for j in i + 1..n {
                    for k in j + 1..n {
                        tried += 1;
                        if tried > self.config.max_combinations {
                            return None;
                        }
                        let triple = [small[i], small[j], small[k]];
                        if fits(&triple) {
                            return Some((big.clone(), triple.iter().map(|vm| (*vm).clone()).collect()));
                        }
                    }
                }
            }
        }
        None
    }

    fn next_group(&mut self) -> u32 {
        let group = self.next_group;
        self.next_group += 1;
        group
    }
}

fn swappable(vm: &Vm, consumed: &HashSet<VmId>) -> bool {
    vm.is_running() && vm.migratable && !consumed.contains(&vm.id)
}

/// Apply every leg of one trade, or none of them.
fn apply_legs(
    cluster: &mut SimulatedCluster,
    legs: &[(&Vm, &str, &str)],
    score: f64,
    reason: &str,
    kind: MoveKind,
    group: u32,
) -> Option<Vec<MigrationSuggestion>> {
    let all_present = legs
        .iter()
        .all(|(vm, from, to)| cluster.get(from).is_some_and(|h| h.vms.contains_key(&vm.id)) && cluster.get(to).is_some());
    if !all_present {
        return None;
    }

    let mut moves = Vec::with_capacity(legs.len());
    for (vm, from, to) in legs {
        let from_cores = cluster.get(from).map_or(0, |h| h.cores());
        let to_cores = cluster.get(to).map_or(0, |h| h.cores());
        cluster.move_vm(vm.id, from, to)?;
        moves.push(
            MigrationSuggestion::new(vm, from, from_cores, to, to_cores, score, reason).with_kind(kind, group),
        );
    }
    Some(moves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmplan_core::{Host, HostStatus, VmStatus};

    fn make_vm(id: u32, host: &str, vcpus: u32, ram_gib: u64) -> Vm {
        Vm {
            id,
            name: format!("vm-{id}"),
            host: host.to_string(),
            status: VmStatus::Running,
            vcpus,
            cpu_usage: 10.0,
            ram_bytes: ram_gib * GIB,
            ram_used_bytes: 0,
            disk_bytes: 20 * GIB,
            disk_used_bytes: None,
            uptime_secs: 0,
            migratable: true,
        }
    }

    fn make_host(name: &str, vms: Vec<Vm>) -> Host {
        Host {
            name: name.to_string(),
            status: HostStatus::Online,
            cores: 16,
            cpu_model: String::new(),
            ram_bytes: 256 * GIB,
            storage_bytes: 4096 * GIB,
            vms,
        }
    }

    #[test]
    fn budget_is_clamped() {
        let config = SwapConfig::default();
        assert_eq!(SwapOptimizer::new(&config, 10).budget(), 5);
        assert_eq!(SwapOptimizer::new(&config, 120).budget(), 12);
        assert_eq!(SwapOptimizer::new(&config, 1000).budget(), 20);
    }

    #[test]
    fn one_for_one_swaps_high_vcpu_vm() {
        // hostA: 16 vCPUs on 16 cores (100%), hostB: 2 on 16 (12.5%).
        let hosts = vec![
            make_host("hostA", vec![make_vm(1, "hostA", 8, 16), make_vm(2, "hostA", 8, 16)]),
            make_host("hostB", vec![make_vm(3, "hostB", 2, 16)]),
        ];
        let mut cluster = SimulatedCluster::from_hosts(&hosts);
        let mut consumed = HashSet::new();
        let config = SwapConfig::default();

        let run = SwapOptimizer::new(&config, 3).run(&mut cluster, &mut consumed);

        assert_eq!(run.swaps, 1);
        assert_eq!(run.suggestions.len(), 2);
        let out = &run.suggestions[0];
        let back = &run.suggestions[1];
        assert_eq!((out.vm.id, out.source.as_str(), out.target.as_str()), (1, "hostA", "hostB"));
        assert_eq!((back.vm.id, back.source.as_str(), back.target.as_str()), (3, "hostB", "hostA"));
        assert!(run.suggestions.iter().all(|s| s.kind == MoveKind::Swap && s.group == Some(1)));
        assert!(consumed.contains(&1) && consumed.contains(&3));
        // RAM unchanged on both hosts, vCPUs moved.
        assert_eq!(cluster.get("hostA").unwrap().state().ram_used, 32 * GIB);
        assert_eq!(cluster.get("hostA").unwrap().state().vcpus, 10);
    }

    #[test]
    fn one_for_one_requires_similar_ram() {
        let hosts = vec![
            make_host("hostA", vec![make_vm(1, "hostA", 8, 32), make_vm(2, "hostA", 8, 32)]),
            make_host("hostB", vec![make_vm(3, "hostB", 2, 4)]),
        ];
        let mut cluster = SimulatedCluster::from_hosts(&hosts);
        let config = SwapConfig::default();

        let run = SwapOptimizer::new(&config, 3).run(&mut cluster, &mut HashSet::new());
        assert_eq!(run.swaps, 0);
    }

    #[test]
    fn consumed_vms_are_left_alone() {
        let hosts = vec![
            make_host("hostA", vec![make_vm(1, "hostA", 8, 16), make_vm(2, "hostA", 8, 16)]),
            make_host("hostB", vec![make_vm(3, "hostB", 2, 16)]),
        ];
        let mut cluster = SimulatedCluster::from_hosts(&hosts);
        let mut consumed: HashSet<VmId> = [3].into_iter().collect();
        let config = SwapConfig::default();

        let run = SwapOptimizer::new(&config, 3).run(&mut cluster, &mut consumed);
        assert_eq!(run.swaps, 0);
    }

    #[test]
    fn one_for_many_evens_vm_counts() {
        // "many" has 6 small VMs, "few" has one 16 GiB VM; average is 3.5.
        let smalls: Vec<Vm> = (1..=6).map(|id| make_vm(id, "many", 1, 8)).collect();
        let hosts = vec![
            make_host("many", smalls),
            make_host("few", vec![make_vm(10, "few", 4, 16)]),
        ];
        let mut cluster = SimulatedCluster::from_hosts(&hosts);
        let mut consumed = HashSet::new();
        let mut config = SwapConfig::default();
        config.vcpu_threshold = 1000.0;

        let run = SwapOptimizer::new(&config, 7).run(&mut cluster, &mut consumed);

        assert_eq!(run.swaps, 1);
        assert_eq!(run.suggestions.len(), 3);
        assert!(run.suggestions.iter().all(|s| s.kind == MoveKind::MultiSwap));
        assert_eq!(run.suggestions[0].vm.id, 10);
        assert_eq!(cluster.get("many").unwrap().state().vm_count, 5);
        assert_eq!(cluster.get("few").unwrap().state().vm_count, 2);
    }
}

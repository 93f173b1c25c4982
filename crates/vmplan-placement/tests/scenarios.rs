//! End-to-end planning scenarios through [`Planner`].
//!
//! - Offload by count picks the smallest VM
//! - Balancing moves load from the heavy host to the light one
//! - Invalid targets are rejected before planning
//! - Non-migratable VMs never move, in any mode
//! - Capacity and storage headroom hold in every plan

use std::collections::HashMap;

use vmplan_core::{
    ClusterSnapshot, GIB, Host, HostStatus, MigrationRequest, PlanError, PlannerConfig,
    ValidationError, Vm, VmStatus, compute_state,
};
use vmplan_placement::{BalanceOutcome, MigrationPlan, Planner, SimulatedCluster};

fn vm(id: u32, host: &str, vcpus: u32, ram_gib: u64) -> Vm {
    Vm {
        id,
        name: format!("vm-{id}"),
        host: host.to_string(),
        status: VmStatus::Running,
        vcpus,
        cpu_usage: 15.0,
        ram_bytes: ram_gib * GIB,
        ram_used_bytes: ram_gib * GIB / 2,
        disk_bytes: 60 * GIB,
        disk_used_bytes: None,
        uptime_secs: 0,
        migratable: true,
    }
}

fn host(name: &str, ram_gib: u64, vms: Vec<Vm>) -> Host {
    Host {
        name: name.to_string(),
        status: HostStatus::Online,
        cores: 32,
        cpu_model: "EPYC 7443P".to_string(),
        ram_bytes: ram_gib * GIB,
        storage_bytes: 8192 * GIB,
        vms,
    }
}

fn planner() -> Planner {
    Planner::new(PlannerConfig::default())
}

fn balance_request() -> MigrationRequest {
    MigrationRequest {
        balance_cluster: true,
        ..MigrationRequest::default()
    }
}

fn offload(f: impl FnOnce(&mut MigrationRequest)) -> MigrationRequest {
    let mut req = MigrationRequest {
        source_host: Some("pve1".to_string()),
        ..MigrationRequest::default()
    };
    f(&mut req);
    req
}

/// Three hosts: pve1 crowded, pve2 and pve3 mostly idle.
fn lopsided_cluster() -> ClusterSnapshot {
    let crowded: Vec<Vm> = (1..=10)
        .map(|id| vm(id, "pve1", 2 + id % 3 * 2, 8 + u64::from(id % 4) * 4))
        .collect();
    ClusterSnapshot::new(vec![
        host("pve1", 256, crowded),
        host("pve2", 256, vec![vm(50, "pve2", 2, 8)]),
        host("pve3", 256, vec![vm(60, "pve3", 4, 16)]),
    ])
}

fn assert_within_capacity(snapshot: &ClusterSnapshot, plan: &MigrationPlan) {
    let mut incoming: HashMap<&str, u64> = HashMap::new();
    let mut outgoing: HashMap<&str, u64> = HashMap::new();
    for s in plan.suggestions.iter().filter(|s| s.is_placed()) {
        *incoming.entry(s.target.as_str()).or_insert(0) += s.vm.ram_bytes;
        *outgoing.entry(s.source.as_str()).or_insert(0) += s.vm.ram_bytes;
    }
    for h in &snapshot.hosts {
        let state = compute_state(h);
        let after = state.ram_used + incoming.get(h.name.as_str()).copied().unwrap_or(0)
            - outgoing.get(h.name.as_str()).copied().unwrap_or(0);
        assert!(after <= h.ram_bytes, "{} overcommitted: {after} > {}", h.name, h.ram_bytes);
    }
    for impact in &plan.host_states {
        for pct in [
            impact.after.cpu_percent(),
            impact.after.ram_percent(),
            impact.after.storage_percent(),
        ] {
            assert!((0.0..=100.0).contains(&pct));
        }
    }
}

// ── Single source ────────────────────────────────────────────────────

#[test]
fn count_offload_picks_smallest_vm() {
    let snapshot = ClusterSnapshot::new(vec![
        host("pve1", 128, vec![vm(1, "pve1", 4, 16), vm(2, "pve1", 2, 8)]),
        host("pve2", 128, vec![]),
    ]);

    let plan = planner()
        .plan(&snapshot, &offload(|r| r.vm_count = Some(1)))
        .unwrap();

    assert_eq!(plan.suggestions.len(), 1);
    assert_eq!(plan.suggestions[0].vm.id, 2);
    assert_eq!(plan.suggestions[0].target, "pve2");
    assert_eq!(plan.totals.vcpus, 2);
    assert_eq!(plan.totals.ram_bytes, 8 * GIB);
}

#[test]
fn zero_storage_target_is_rejected() {
    let err = planner()
        .plan(&lopsided_cluster(), &offload(|r| r.storage_target_bytes = Some(0)))
        .unwrap_err();

    assert_eq!(
        err,
        PlanError::Validation(ValidationError::new(
            "storage_target_bytes",
            "storage amount must be > 0"
        ))
    );
}

#[test]
fn migrate_all_evacuates_source_within_capacity() {
    let snapshot = lopsided_cluster();
    let plan = planner().plan(&snapshot, &offload(|_| {})).unwrap();

    assert_eq!(plan.mode, "migrate all");
    assert_eq!(plan.suggestions.len() + plan.unplaced.len(), 10);
    assert!(plan.unplaced.is_empty());
    assert!(plan.suggestions.iter().all(|s| s.source == "pve1" && s.target != "pve1"));
    assert_within_capacity(&snapshot, &plan);
}

#[test]
fn serial_migrate_all_is_deterministic() {
    let snapshot = lopsided_cluster();
    let mut config = PlannerConfig::default();
    config.single_source.workers = 1;
    let planner = Planner::new(config);

    let first = planner.plan(&snapshot, &offload(|_| {})).unwrap();
    let second = planner.plan(&snapshot, &offload(|_| {})).unwrap();
    assert_eq!(first.suggestions, second.suggestions);
}

#[test]
fn offload_never_overfills_destinations() {
    let big: Vec<Vm> = (1..=8).map(|id| vm(id, "pve1", 4, 24)).collect();
    let snapshot = ClusterSnapshot::new(vec![
        host("pve1", 256, big),
        host("pve2", 64, vec![]),
        host("pve3", 48, vec![]),
    ]);

    let plan = planner()
        .plan(&snapshot, &offload(|r| r.ram_target_bytes = Some(200 * GIB)))
        .unwrap();

    // 2 fit on pve2, 2 on pve3.
    assert_eq!(plan.suggestions.len(), 4);
    assert_eq!(plan.unplaced.len(), 4);
    assert_within_capacity(&snapshot, &plan);
}

#[test]
fn excluded_host_never_receives() {
    let snapshot = lopsided_cluster();
    let plan = planner()
        .plan(
            &snapshot,
            &offload(|r| {
                r.vm_count = Some(4);
                r.exclude_hosts = vec!["pve2".to_string()];
            }),
        )
        .unwrap();

    assert_eq!(plan.suggestions.len(), 4);
    assert!(plan.suggestions.iter().all(|s| s.target == "pve3"));
}

// ── Balance ──────────────────────────────────────────────────────────

#[test]
fn balancing_moves_from_heavy_to_light() {
    let heavy: Vec<Vm> = (1..=10).map(|id| vm(id, "host1", 4, 20)).collect();
    let snapshot = ClusterSnapshot::new(vec![
        host("host1", 256, heavy),
        host("host2", 256, vec![vm(100, "host2", 2, 8)]),
    ]);

    let plan = planner().plan(&snapshot, &balance_request()).unwrap();

    assert!(
        plan.suggestions
            .iter()
            .any(|s| s.source == "host1" && s.target == "host2")
    );
    let summary = plan.balance.as_ref().unwrap();
    assert!(summary.migrations >= 1);
    assert_ne!(summary.outcome, BalanceOutcome::IterationCap);
    assert!(plan.improvement.after_stddev < plan.improvement.before_stddev);
    assert!(plan.improvement.after_stddev <= 3.0);
    assert_within_capacity(&snapshot, &plan);
}

#[test]
fn balancing_never_increases_ram_deviation() {
    let snapshot = lopsided_cluster();
    let plan = planner().plan(&snapshot, &balance_request()).unwrap();
    let summary = plan.balance.as_ref().unwrap();
    assert!(summary.iterations <= PlannerConfig::default().balance.max_iterations);

    let mut cluster = SimulatedCluster::from_hosts(&snapshot.hosts);
    let avg = cluster.metrics().avg_ram_percent();
    let mut deviation = cluster.ram_deviation_sum(avg);

    // Replay the balance moves in order; swaps come after them.
    for s in plan.suggestions.iter().take(summary.migrations) {
        cluster.move_vm(s.vm.id, &s.source, &s.target).unwrap();
        let next = cluster.ram_deviation_sum(avg);
        assert!(next <= deviation + 1e-9, "deviation grew from {deviation} to {next}");
        deviation = next;
    }
}

#[test]
fn balanced_cluster_is_rejected() {
    let snapshot = ClusterSnapshot::new(vec![
        host("a", 128, vec![vm(1, "a", 4, 16)]),
        host("b", 128, vec![vm(2, "b", 4, 16)]),
    ]);

    let err = planner().plan(&snapshot, &balance_request()).unwrap_err();
    assert_eq!(err, PlanError::NoBeneficialPlan("already balanced".to_string()));
}

#[test]
fn offline_hosts_do_not_count_toward_balance() {
    let mut down = host("down", 256, vec![]);
    down.status = HostStatus::Offline;
    let snapshot = ClusterSnapshot::new(vec![host("a", 128, vec![vm(1, "a", 4, 64)]), down]);

    let err = planner().plan(&snapshot, &balance_request()).unwrap_err();
    assert_eq!(err, PlanError::InsufficientNodes { eligible: 1 });
}

#[test]
fn storage_headroom_is_kept() {
    // Receiver has plenty of RAM but only 800 GiB of storage: two 100 GiB
    // VMs fit above the 515 GiB headroom, a third would not.
    let heavy: Vec<Vm> = (1..=6)
        .map(|id| {
            let mut v = vm(id, "host1", 2, 24);
            v.disk_bytes = 100 * GIB;
            v
        })
        .collect();
    let mut tight = host("host2", 256, vec![]);
    tight.storage_bytes = 800 * GIB;
    let snapshot = ClusterSnapshot::new(vec![host("host1", 256, heavy), tight]);

    let plan = planner().plan(&snapshot, &balance_request()).unwrap();
    assert_eq!(plan.suggestions.len(), 2);

    for impact in plan.host_states.iter().filter(|h| h.after.vm_count > h.before.vm_count) {
        let resident = snapshot.host(&impact.host).map_or(0, |h| {
            h.vms.iter().map(Vm::effective_disk).max().unwrap_or(0)
        });
        let incoming = plan
            .suggestions
            .iter()
            .filter(|s| s.target == impact.host)
            .map(|s| s.vm.effective_disk())
            .max()
            .unwrap_or(0);
        let largest = resident.max(incoming);
        let headroom = 500 * GIB + largest * 15 / 100;
        assert!(
            impact.after.storage_free() >= headroom,
            "{} left with {} bytes free",
            impact.host,
            impact.after.storage_free()
        );
    }
}

// ── Migratability ────────────────────────────────────────────────────

#[test]
fn pinned_vm_never_moves_in_any_mode() {
    let mut cluster = lopsided_cluster();
    for v in &mut cluster.hosts[0].vms {
        if v.id == 1 || v.id == 2 {
            v.migratable = false;
        }
    }

    let requests = vec![
        offload(|_| {}),
        offload(|r| r.vm_count = Some(10)),
        offload(|r| r.vcpu_target = Some(1000)),
        offload(|r| r.cpu_percent_target = Some(100.0)),
        offload(|r| r.ram_target_bytes = Some(10_000 * GIB)),
        offload(|r| r.storage_target_bytes = Some(100_000 * GIB)),
        offload(|r| r.vm_ids = vec![1, 2, 3]),
        balance_request(),
    ];

    for request in requests {
        let Ok(plan) = planner().plan(&cluster, &request) else {
            continue;
        };
        assert!(
            plan.suggestions.iter().all(|s| s.vm.id != 1 && s.vm.id != 2),
            "pinned VM moved for {request:?}"
        );
    }
}

#[test]
fn explicit_pinned_vm_is_reported_unplaced() {
    let mut cluster = lopsided_cluster();
    cluster.hosts[0].vms[0].migratable = false;

    let plan = planner()
        .plan(&cluster, &offload(|r| r.vm_ids = vec![1]))
        .unwrap();
    assert!(plan.suggestions.is_empty());
    assert_eq!(plan.unplaced[0].vm_id, 1);
    assert_eq!(plan.unplaced[0].reason, "vm is not migratable");
}

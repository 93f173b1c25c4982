//! `vmplan plan` and `vmplan balance`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use vmplan_core::{ClusterSnapshot, MigrationRequest, PlannerConfig, StaticDiskUsage};
use vmplan_placement::{MigrationPlan, Planner};

use super::report::format_plan;

/// Files shared by both planning commands.
pub struct Inputs<'a> {
    pub snapshot: &'a str,
    pub config: Option<&'a str>,
    pub disk_usage: Option<&'a str>,
}

pub fn load_request(path: Option<&str>) -> Result<MigrationRequest> {
    let Some(path) = path else {
        return Ok(MigrationRequest::default());
    };
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read request {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid request in {path}"))
}

pub fn run(inputs: &Inputs<'_>, request: &MigrationRequest, format: &str) -> Result<()> {
    let plan = compute(inputs, request)?;
    print_plan(&plan, format)
}

pub fn balance(inputs: &Inputs<'_>, exclude: Vec<String>, format: &str) -> Result<()> {
    let request = MigrationRequest {
        balance_cluster: true,
        exclude_hosts: exclude,
        ..MigrationRequest::default()
    };
    run(inputs, &request, format)
}

pub fn compute(inputs: &Inputs<'_>, request: &MigrationRequest) -> Result<MigrationPlan> {
    let content = std::fs::read_to_string(inputs.snapshot)
        .with_context(|| format!("Failed to read snapshot {}", inputs.snapshot))?;
    let snapshot = ClusterSnapshot::from_json(&content)
        .with_context(|| format!("Invalid snapshot in {}", inputs.snapshot))?;

    let config = match inputs.config {
        Some(path) => PlannerConfig::from_file(Path::new(path))
            .with_context(|| format!("Failed to load config {path}"))?,
        None => PlannerConfig::default(),
    };

    let mut planner = Planner::new(config);
    if let Some(path) = inputs.disk_usage {
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read disk usage {path}"))?;
        let table = StaticDiskUsage::from_json(&content)?;
        info!(entries = table.len(), "loaded disk usage table");
        planner = planner.with_disk_lookup(Arc::new(table));
    }

    info!(
        hosts = snapshot.hosts.len(),
        vms = snapshot.vm_count(),
        "loaded cluster snapshot"
    );
    Ok(planner.plan(&snapshot, request)?)
}

fn print_plan(plan: &MigrationPlan, format: &str) -> Result<()> {
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(plan)?);
        }
        _ => {
            println!("{}", format_plan(plan));
        }
    }
    Ok(())
}

//! vmplan.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults
//! below, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlannerConfig {
    pub scoring: ScoringWeights,
    pub single_source: SingleSourceConfig,
    pub balance: BalanceConfig,
    pub swap: SwapConfig,
}

/// Weights for utilization and destination scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringWeights {
    /// Utilization score = cpu·CPU% + ram·RAM% + storage·Storage%.
    pub cpu: f64,
    pub ram: f64,
    pub storage: f64,
    /// Destination score = utilization·(100 − util) + balance·(100 − stddev).
    pub utilization: f64,
    pub balance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cpu: 0.4,
            ram: 0.4,
            storage: 0.2,
            utilization: 0.7,
            balance: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SingleSourceConfig {
    /// Upper bound on the migrate-all worker pool. 1 plans serially.
    pub workers: usize,
    /// Points above the cluster target a destination may reach in migrate-all.
    pub target_band: f64,
}

impl Default for SingleSourceConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            target_band: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BalanceConfig {
    pub max_iterations: usize,
    pub workers: usize,
    /// Composite deviation (points) beyond which a host is a donor/receiver.
    pub donor_threshold: f64,
    /// Converged when every host is this close to average RAM% and vCPU%.
    pub convergence_tolerance: f64,
    pub vcpu_weight: f64,
    pub ram_weight: f64,
    pub vm_count_weight: f64,
    /// Hard caps on a receiver after the move, in percent.
    pub cpu_cap: f64,
    pub ram_cap: f64,
    pub storage_cap: f64,
    /// A receiver this close to average may not be pushed past
    /// average + `near_average_ceiling`.
    pub near_average_band: f64,
    pub near_average_ceiling: f64,
    /// Free storage a receiver keeps: floor + fraction × largest resident disk.
    pub headroom_floor_gib: u64,
    pub headroom_fraction: f64,
    pub improvement_weight: f64,
    pub size_bonus: f64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            workers: 32,
            donor_threshold: 2.0,
            convergence_tolerance: 3.0,
            vcpu_weight: 0.3,
            ram_weight: 0.5,
            vm_count_weight: 0.2,
            cpu_cap: 95.0,
            ram_cap: 90.0,
            storage_cap: 85.0,
            near_average_band: 2.0,
            near_average_ceiling: 5.0,
            headroom_floor_gib: 500,
            headroom_fraction: 0.15,
            improvement_weight: 10.0,
            size_bonus: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwapConfig {
    pub enabled: bool,
    /// vCPU% points above/below average that qualify a host for swapping.
    pub vcpu_threshold: f64,
    pub min_budget: usize,
    pub max_budget: usize,
    /// One swap of budget per this many VMs in the cluster.
    pub vms_per_swap_budget: usize,
    /// 1-for-1 partners must be within max(fraction × RAM, floor) of each other.
    pub ram_tolerance_fraction: f64,
    pub ram_tolerance_floor_gib: u64,
    /// Minimum RAM of the single VM in a one-for-many trade.
    pub large_vm_ram_gib: u64,
    pub multi_ram_tolerance: f64,
    /// VM-count distance from average that marks a host as imbalanced.
    pub count_imbalance: f64,
    pub max_small_candidates: usize,
    pub max_combinations: usize,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vcpu_threshold: 5.0,
            min_budget: 5,
            max_budget: 20,
            vms_per_swap_budget: 10,
            ram_tolerance_fraction: 0.2,
            ram_tolerance_floor_gib: 2,
            large_vm_ram_gib: 8,
            multi_ram_tolerance: 0.3,
            count_imbalance: 2.0,
            max_small_candidates: 16,
            max_combinations: 5000,
        }
    }
}

impl PlannerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: PlannerConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

//! vmplan-core — data model for VM migration planning.
//!
//! Describes a cluster snapshot (hosts and their VMs), the derived
//! [`ResourceState`] of each host, validated [`MigrationConstraints`],
//! planner configuration, and the error types shared by the placement
//! engine and the command layer.
//!
//! Snapshots are read-only; planning happens on private copies in
//! `vmplan-placement`.

pub mod config;
pub mod constraints;
pub mod disk;
pub mod error;
pub mod state;
pub mod types;

pub use config::{BalanceConfig, PlannerConfig, ScoringWeights, SingleSourceConfig, SwapConfig};
pub use constraints::{
    DEFAULT_MIN_AGE_DAYS, MigrationConstraints, MigrationRequest, MinFreeThresholds, SelectionMode,
};
pub use disk::{DiskUsageEntry, DiskUsageLookup, NoDiskUsage, StaticDiskUsage, resolve_disk_usage};
pub use error::{PlanError, PlanResult, ValidationError};
pub use state::{ClusterMetrics, ResourceState, apply_delta, compute_state, has_capacity, std_dev};
pub use types::*;

//! vmplan placement engine — decides which VMs move where.
//!
//! Works on private simulated copies of a [`vmplan_core::ClusterSnapshot`]
//! and never touches a live cluster. The [`Planner`] dispatches a
//! validated request to one of two pipelines:
//!
//! - **single source** — offload selected VMs from one host
//!   ([`selector`], [`scorer`], [`single_source`], [`migrate_all`])
//! - **balance** — greedy cluster-wide rebalancing followed by a swap pass
//!   ([`balance`], [`swap`])
//!
//! Both end in [`result::build_plan`], so every plan has the same shape.

pub mod balance;
pub mod migrate_all;
pub mod planner;
pub mod result;
pub mod scorer;
pub mod selector;
pub mod simulation;
pub mod single_source;
pub mod suggestion;
pub mod swap;

pub use balance::{
    BalanceEngine, BalanceOutcome, BalanceSummary, HostClassification, classify_hosts,
    evaluate_candidate,
};
pub use migrate_all::plan_migrate_all_parallel;
pub use planner::Planner;
pub use result::{HostImpact, Improvement, MigrationPlan, MoveTotals, build_plan, ram_deviation_stddev};
pub use scorer::{DestinationScore, rank_destinations, score_destination};
pub use selector::{Selection, select_vms};
pub use simulation::{SimulatedCluster, SimulatedHostState};
pub use single_source::{SingleSourceOutcome, choose_destination, plan_single_source};
pub use suggestion::{MigrationSuggestion, MoveKind, NO_TARGET, UnplacedVm};
pub use swap::{SwapOptimizer, SwapRun};

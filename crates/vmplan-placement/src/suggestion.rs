//! Migration suggestions produced by the planners.

use serde::Serialize;

use vmplan_core::{HostName, Vm, VmId};

/// Destination recorded for a VM with no legal target.
pub const NO_TARGET: &str = "NONE";

/// How a suggestion came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveKind {
    /// Plain one-way migration.
    Migrate,
    /// One leg of a 1-for-1 exchange.
    Swap,
    /// One leg of a one-for-many exchange.
    MultiSwap,
}

/// A recommended migration of one VM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationSuggestion {
    /// The VM as it was on the source host.
    pub vm: Vm,
    pub source: HostName,
    /// Target host, or [`NO_TARGET`].
    pub target: HostName,
    /// Desirability; higher is better. Comparable within one planner only.
    pub score: f64,
    pub reason: String,
    pub kind: MoveKind,
    /// Ties together the legs of one swap.
    pub group: Option<u32>,
    pub source_cores: u32,
    pub target_cores: u32,
}

impl MigrationSuggestion {
    pub fn new(
        vm: &Vm,
        source: &str,
        source_cores: u32,
        target: &str,
        target_cores: u32,
        score: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            vm: vm.clone(),
            source: source.to_string(),
            target: target.to_string(),
            score,
            reason: reason.into(),
            kind: MoveKind::Migrate,
            group: None,
            source_cores,
            target_cores,
        }
    }

    /// A VM that has nowhere to go.
    pub fn unplaced(vm: &Vm, source: &str, source_cores: u32, reason: impl Into<String>) -> Self {
        Self::new(vm, source, source_cores, NO_TARGET, 0, 0.0, reason)
    }

    pub fn with_kind(mut self, kind: MoveKind, group: u32) -> Self {
        self.kind = kind;
        self.group = Some(group);
        self
    }

    pub fn is_placed(&self) -> bool {
        self.target != NO_TARGET
    }

    pub fn vm_id(&self) -> VmId {
        self.vm.id
    }

    /// Share of the source host's logical CPUs the VM's vCPUs represent.
    pub fn source_vcpu_share(&self) -> f64 {
        share(self.vm.vcpus, self.source_cores)
    }

    pub fn target_vcpu_share(&self) -> f64 {
        share(self.vm.vcpus, self.target_cores)
    }
}

fn share(vcpus: u32, cores: u32) -> f64 {
    if cores == 0 {
        return 0.0;
    }
    f64::from(vcpus) / f64::from(cores) * 100.0
}

/// A VM the single-source planner could not migrate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnplacedVm {
    pub vm_id: VmId,
    pub vm_name: String,
    pub reason: String,
}

impl From<&MigrationSuggestion> for UnplacedVm {
    fn from(s: &MigrationSuggestion) -> Self {
        Self {
            vm_id: s.vm.id,
            vm_name: s.vm.name.clone(),
            reason: s.reason.clone(),
        }
    }
}

//! Domain types for a cluster snapshot.
//!
//! These types describe hosts and their resident VMs exactly as the
//! inventory collaborator reported them. They are read-only inputs to
//! planning; the placement engine mutates private copies only. All types
//! are serializable so snapshots can be loaded from JSON.

use serde::{Deserialize, Serialize};

/// Numeric VM identifier, unique across the cluster.
pub type VmId = u32;

/// Host name, unique across the cluster.
pub type HostName = String;

/// One gibibyte in bytes.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Seconds in one day.
pub const SECS_PER_DAY: u64 = 86_400;

// ── VM ────────────────────────────────────────────────────────────

/// Power state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Running,
    Stopped,
}

/// A virtual machine as reported by the inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vm {
    pub id: VmId,
    pub name: String,
    /// Host the VM currently resides on.
    pub host: HostName,
    pub status: VmStatus,
    /// Allocated vCPUs.
    pub vcpus: u32,
    /// CPU utilization as a percentage of the allocated vCPUs (0–100).
    #[serde(default)]
    pub cpu_usage: f64,
    /// Allocated RAM in bytes.
    pub ram_bytes: u64,
    /// RAM the guest is actually using, in bytes.
    #[serde(default)]
    pub ram_used_bytes: u64,
    /// Allocated (provisioned) disk in bytes.
    pub disk_bytes: u64,
    /// Actually used disk in bytes, when known (thin provisioning).
    #[serde(default)]
    pub disk_used_bytes: Option<u64>,
    /// Seconds since the VM was last started.
    #[serde(default)]
    pub uptime_secs: u64,
    #[serde(default = "default_migratable")]
    pub migratable: bool,
}

fn default_migratable() -> bool {
    true
}

impl Vm {
    pub fn is_running(&self) -> bool {
        self.status == VmStatus::Running
    }

    /// Disk footprint used for storage accounting: the actually used size
    /// when known, otherwise the allocated size.
    pub fn effective_disk(&self) -> u64 {
        match self.disk_used_bytes {
            Some(used) if used > 0 => used,
            _ => self.disk_bytes,
        }
    }

    /// Estimated physical CPU consumption in cores.
    pub fn cpu_load_cores(&self) -> f64 {
        let usage = self.cpu_usage.clamp(0.0, 100.0);
        f64::from(self.vcpus) * usage / 100.0
    }

    pub fn ram_gib(&self) -> f64 {
        self.ram_bytes as f64 / GIB as f64
    }

    pub fn effective_disk_gib(&self) -> f64 {
        self.effective_disk() as f64 / GIB as f64
    }

    pub fn age_days(&self) -> u64 {
        self.uptime_secs / SECS_PER_DAY
    }
}

// ── Host ──────────────────────────────────────────────────────────

/// Availability of a host for planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Online,
    Offline,
    /// Online but excluded from migrations (maintenance, HA lock, ...).
    MigrationBlocked,
}

/// A hypervisor host and the VMs resident on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub name: HostName,
    pub status: HostStatus,
    /// Logical CPU count (cores × threads).
    pub cores: u32,
    #[serde(default)]
    pub cpu_model: String,
    /// Total RAM in bytes.
    pub ram_bytes: u64,
    /// Total VM storage in bytes.
    pub storage_bytes: u64,
    #[serde(default)]
    pub vms: Vec<Vm>,
}

impl Host {
    /// Online and not blocked from migrations.
    pub fn is_eligible(&self) -> bool {
        self.status == HostStatus::Online
    }

    pub fn vm(&self, id: VmId) -> Option<&Vm> {
        self.vms.iter().find(|vm| vm.id == id)
    }
}

// ── Snapshot ──────────────────────────────────────────────────────

/// Point-in-time inventory of the cluster, pulled once per planning run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterSnapshot {
    pub hosts: Vec<Host>,
}

impl ClusterSnapshot {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self { hosts }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Hosts that may take part in planning.
    pub fn eligible_hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(|h| h.is_eligible())
    }

    pub fn vm_count(&self) -> usize {
        self.hosts.iter().map(|h| h.vms.len()).sum()
    }
}

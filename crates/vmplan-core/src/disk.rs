//! Disk-usage lookup collaborator.
//!
//! Thin-provisioned disks report an allocated size that can be far above
//! what is actually written. An external cache may know the real usage;
//! the planner asks it through [`DiskUsageLookup`] and otherwise falls
//! back to what the snapshot carries. Freshness of that cache is the
//! collaborator's concern.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ClusterSnapshot, HostName, VmId};

/// Source of actually-used disk bytes for a VM on a host.
pub trait DiskUsageLookup: Send + Sync {
    /// Used bytes, or `None` when unknown.
    fn disk_usage(&self, vm_id: VmId, host: &str) -> Option<u64>;
}

/// Lookup that never knows anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiskUsage;

impl DiskUsageLookup for NoDiskUsage {
    fn disk_usage(&self, _vm_id: VmId, _host: &str) -> Option<u64> {
        None
    }
}

/// One row of a static disk-usage table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsageEntry {
    pub vm_id: VmId,
    pub host: HostName,
    pub used_bytes: u64,
}

/// In-memory disk-usage table keyed by (VM, host).
#[derive(Debug, Clone, Default)]
pub struct StaticDiskUsage {
    entries: HashMap<(VmId, HostName), u64>,
}

impl StaticDiskUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vm_id: VmId, host: &str, used_bytes: u64) {
        self.entries.insert((vm_id, host.to_string()), used_bytes);
    }

    pub fn from_entries(entries: impl IntoIterator<Item = DiskUsageEntry>) -> Self {
        let mut table = Self::new();
        for e in entries {
            table.insert(e.vm_id, &e.host, e.used_bytes);
        }
        table
    }

    /// Parse a JSON array of [`DiskUsageEntry`].
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let entries: Vec<DiskUsageEntry> = serde_json::from_str(json)?;
        Ok(Self::from_entries(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DiskUsageLookup for StaticDiskUsage {
    fn disk_usage(&self, vm_id: VmId, host: &str) -> Option<u64> {
        self.entries.get(&(vm_id, host.to_string())).copied()
    }
}

/// Copy of `snapshot` with each VM's used disk filled from `lookup`
/// where the lookup knows it. The input snapshot is left untouched.
pub fn resolve_disk_usage(snapshot: &ClusterSnapshot, lookup: &dyn DiskUsageLookup) -> ClusterSnapshot {
    let mut resolved = snapshot.clone();
    let mut hits = 0usize;
    for host in &mut resolved.hosts {
        for vm in &mut host.vms {
            if let Some(used) = lookup.disk_usage(vm.id, &host.name) {
                vm.disk_used_bytes = Some(used);
                hits += 1;
            }
        }
    }
    debug!(hits, vms = resolved.vm_count(), "resolved effective disk sizes");
    resolved
}

//! Migration request validation.
//!
//! A [`MigrationRequest`] is the loosely-typed input from the command
//! layer: every criterion is optional. [`MigrationRequest::validate`]
//! resolves it once into [`MigrationConstraints`], whose
//! [`SelectionMode`] names exactly one selection policy. The planner
//! dispatches on that mode and never re-inspects the raw fields.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ValidationError;
use crate::types::{HostName, VmId};

/// Minimum age used when age-based selection is requested without one.
pub const DEFAULT_MIN_AGE_DAYS: u32 = 75;

/// Free capacity a destination must keep after a migration, in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinFreeThresholds {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub storage_percent: f64,
}

/// Raw migration request as submitted by the command layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationRequest {
    pub source_host: Option<HostName>,
    /// Explicit VMs to migrate.
    pub vm_ids: Vec<VmId>,
    /// Migrate the N smallest VMs.
    pub vm_count: Option<usize>,
    /// Free at least this many vCPUs on the source.
    pub vcpu_target: Option<u32>,
    /// Reduce the source's CPU% by at least this many points.
    pub cpu_percent_target: Option<f64>,
    pub ram_target_bytes: Option<u64>,
    pub storage_target_bytes: Option<u64>,
    /// Select long-running VMs.
    pub select_by_age: bool,
    pub min_age_days: Option<u32>,
    pub migrate_all: bool,
    pub balance_cluster: bool,
    pub exclude_hosts: Vec<HostName>,
    pub max_vms_per_host: Option<usize>,
    pub min_free: MinFreeThresholds,
}

/// The single selection policy a request resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectionMode {
    Vms { ids: Vec<VmId> },
    Count { count: usize },
    Vcpus { target: u32 },
    CpuPercent { target: f64 },
    Ram { target_bytes: u64 },
    Storage { target_bytes: u64 },
    Age { min_age_days: u32 },
    All,
    BalanceCluster,
}

impl SelectionMode {
    pub fn label(&self) -> &'static str {
        match self {
            SelectionMode::Vms { .. } => "explicit VMs",
            SelectionMode::Count { .. } => "VM count",
            SelectionMode::Vcpus { .. } => "vCPU target",
            SelectionMode::CpuPercent { .. } => "CPU target",
            SelectionMode::Ram { .. } => "RAM target",
            SelectionMode::Storage { .. } => "storage target",
            SelectionMode::Age { .. } => "VM age",
            SelectionMode::All => "migrate all",
            SelectionMode::BalanceCluster => "balance cluster",
        }
    }

    pub fn is_balance(&self) -> bool {
        matches!(self, SelectionMode::BalanceCluster)
    }
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConstraints {
    /// `None` only in balance mode.
    pub source_host: Option<HostName>,
    pub mode: SelectionMode,
    pub exclude_hosts: HashSet<HostName>,
    pub max_vms_per_host: Option<usize>,
    pub min_free: MinFreeThresholds,
}

impl MigrationConstraints {
    pub fn is_excluded(&self, host: &str) -> bool {
        self.exclude_hosts.contains(host)
    }
}

impl MigrationRequest {
    /// Validate the request and resolve its selection mode.
    ///
    /// No criterion at all defaults to migrate-all.
    pub fn validate(&self) -> Result<MigrationConstraints, ValidationError> {
        let mode = self.resolve_mode()?;

        let source_host = match (&mode, self.source_host.as_deref().map(str::trim)) {
            (SelectionMode::BalanceCluster, None) | (SelectionMode::BalanceCluster, Some("")) => {
                None
            }
            (SelectionMode::BalanceCluster, Some(_)) => {
                return Err(ValidationError::new(
                    "source_host",
                    "source host must not be set when balancing the cluster",
                ));
            }
            (_, None) | (_, Some("")) => {
                return Err(ValidationError::new("source_host", "source host is required"));
            }
            (_, Some(name)) => Some(name.to_string()),
        };

        let exclude_hosts: HashSet<HostName> = self
            .exclude_hosts
            .iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if let Some(source) = &source_host {
            if exclude_hosts.contains(source) {
                return Err(ValidationError::new(
                    "exclude_hosts",
                    "source host cannot be excluded",
                ));
            }
        }

        if self.max_vms_per_host == Some(0) {
            return Err(ValidationError::new(
                "max_vms_per_host",
                "max vms per host must be > 0",
            ));
        }

        validate_free("min_free.cpu_percent", self.min_free.cpu_percent)?;
        validate_free("min_free.ram_percent", self.min_free.ram_percent)?;
        validate_free("min_free.storage_percent", self.min_free.storage_percent)?;

        debug!(mode = mode.label(), source = ?source_host, "migration request validated");

        Ok(MigrationConstraints {
            source_host,
            mode,
            exclude_hosts,
            max_vms_per_host: self.max_vms_per_host,
            min_free: self.min_free.clone(),
        })
    }

    fn resolve_mode(&self) -> Result<SelectionMode, ValidationError> {
        let mut set: Vec<&'static str> = Vec::new();
        if !self.vm_ids.is_empty() {
            set.push("vm_ids");
        }
        if self.vm_count.is_some() {
            set.push("vm_count");
        }
        if self.vcpu_target.is_some() {
            set.push("vcpu_target");
        }
        if self.cpu_percent_target.is_some() {
            set.push("cpu_percent_target");
        }
        if self.ram_target_bytes.is_some() {
            set.push("ram_target_bytes");
        }
        if self.storage_target_bytes.is_some() {
            set.push("storage_target_bytes");
        }
        if self.select_by_age || self.min_age_days.is_some() {
            set.push("min_age_days");
        }
        if self.migrate_all {
            set.push("migrate_all");
        }
        if self.balance_cluster {
            set.push("balance_cluster");
        }

        if set.len() > 1 {
            return Err(ValidationError::new(
                "mode",
                format!(
                    "exactly one selection criterion may be set (found: {})",
                    set.join(", ")
                ),
            ));
        }

        let Some(field) = set.first().copied() else {
            return Ok(SelectionMode::All);
        };

        let mode = match field {
            "vm_ids" => {
                let mut seen = HashSet::new();
                for id in &self.vm_ids {
                    if !seen.insert(*id) {
                        return Err(ValidationError::new(
                            "vm_ids",
                            format!("duplicate vm id {id}"),
                        ));
                    }
                }
                SelectionMode::Vms {
                    ids: self.vm_ids.clone(),
                }
            }
            "vm_count" => match self.vm_count {
                Some(count) if count > 0 => SelectionMode::Count { count },
                _ => return Err(ValidationError::new("vm_count", "vm count must be > 0")),
            },
            "vcpu_target" => match self.vcpu_target {
                Some(target) if target > 0 => SelectionMode::Vcpus { target },
                _ => {
                    return Err(ValidationError::new(
                        "vcpu_target",
                        "vcpu target must be > 0",
                    ));
                }
            },
            "cpu_percent_target" => match self.cpu_percent_target {
                Some(target) if target > 0.0 && target <= 100.0 => {
                    SelectionMode::CpuPercent { target }
                }
                _ => {
                    return Err(ValidationError::new(
                        "cpu_percent_target",
                        "cpu target must be within (0, 100]",
                    ));
                }
            },
            "ram_target_bytes" => match self.ram_target_bytes {
                Some(target_bytes) if target_bytes > 0 => SelectionMode::Ram { target_bytes },
                _ => {
                    return Err(ValidationError::new(
                        "ram_target_bytes",
                        "ram amount must be > 0",
                    ));
                }
            },
            "storage_target_bytes" => match self.storage_target_bytes {
                Some(target_bytes) if target_bytes > 0 => SelectionMode::Storage { target_bytes },
                _ => {
                    return Err(ValidationError::new(
                        "storage_target_bytes",
                        "storage amount must be > 0",
                    ));
                }
            },
            "min_age_days" => match self.min_age_days {
                None => SelectionMode::Age {
                    min_age_days: DEFAULT_MIN_AGE_DAYS,
                },
                Some(0) => {
                    return Err(ValidationError::new(
                        "min_age_days",
                        "age must be > 0 days",
                    ));
                }
                Some(min_age_days) => SelectionMode::Age { min_age_days },
            },
            "migrate_all" => SelectionMode::All,
            _ => SelectionMode::BalanceCluster,
        };

        Ok(mode)
    }
}

fn validate_free(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !(0.0..100.0).contains(&value) {
        return Err(ValidationError::new(
            field,
            "minimum free percent must be within [0, 100)",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GIB;

    fn with_source() -> MigrationRequest {
        MigrationRequest {
            source_host: Some("pve1".to_string()),
            ..MigrationRequest::default()
        }
    }

    #[test]
    fn no_criterion_defaults_to_migrate_all() {
        let constraints = with_source().validate().unwrap();
        assert_eq!(constraints.mode, SelectionMode::All);
        assert_eq!(constraints.source_host.as_deref(), Some("pve1"));
    }

    #[test]
    fn zero_storage_target_is_rejected() {
        let req = MigrationRequest {
            storage_target_bytes: Some(0),
            ..with_source()
        };
        let err = req.validate().unwrap_err();
        assert_eq!(err.field, "storage_target_bytes");
        assert_eq!(err.reason, "storage amount must be > 0");
    }

    #[test]
    fn multiple_criteria_are_rejected() {
        let req = MigrationRequest {
            vm_count: Some(2),
            ram_target_bytes: Some(8 * GIB),
            ..with_source()
        };
        let err = req.validate().unwrap_err();
        assert_eq!(err.field, "mode");
        assert!(err.reason.contains("vm_count"));
        assert!(err.reason.contains("ram_target_bytes"));
    }

    #[test]
    fn age_selection_defaults_to_75_days() {
        let req = MigrationRequest {
            select_by_age: true,
            ..with_source()
        };
        let constraints = req.validate().unwrap();
        assert_eq!(constraints.mode, SelectionMode::Age { min_age_days: 75 });
    }

    #[test]
    fn source_required_outside_balance_mode() {
        let req = MigrationRequest {
            vm_count: Some(1),
            ..MigrationRequest::default()
        };
        let err = req.validate().unwrap_err();
        assert_eq!(err.field, "source_host");

        let blank = MigrationRequest {
            source_host: Some("  ".to_string()),
            ..MigrationRequest::default()
        };
        assert_eq!(blank.validate().unwrap_err().field, "source_host");
    }

    #[test]
    fn balance_mode_has_no_source() {
        let req = MigrationRequest {
            balance_cluster: true,
            ..MigrationRequest::default()
        };
        let constraints = req.validate().unwrap();
        assert!(constraints.mode.is_balance());
        assert!(constraints.source_host.is_none());

        let with_src = MigrationRequest {
            balance_cluster: true,
            ..with_source()
        };
        assert_eq!(with_src.validate().unwrap_err().field, "source_host");
    }

    #[test]
    fn source_cannot_be_excluded() {
        let req = MigrationRequest {
            exclude_hosts: vec!["pve1".to_string()],
            ..with_source()
        };
        assert_eq!(req.validate().unwrap_err().field, "exclude_hosts");
    }

    #[test]
    fn cpu_target_bounds() {
        for bad in [0.0, -5.0, 100.5, f64::NAN] {
            let req = MigrationRequest {
                cpu_percent_target: Some(bad),
                ..with_source()
            };
            assert!(req.validate().is_err(), "{bad} should be rejected");
        }
        let ok = MigrationRequest {
            cpu_percent_target: Some(100.0),
            ..with_source()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn duplicate_vm_ids_are_rejected() {
        let req = MigrationRequest {
            vm_ids: vec![101, 102, 101],
            ..with_source()
        };
        let err = req.validate().unwrap_err();
        assert_eq!(err.field, "vm_ids");
        assert!(err.reason.contains("101"));
    }

    #[test]
    fn min_free_must_be_a_percentage() {
        let req = MigrationRequest {
            min_free: MinFreeThresholds {
                ram_percent: 100.0,
                ..MinFreeThresholds::default()
            },
            ..with_source()
        };
        assert_eq!(req.validate().unwrap_err().field, "min_free.ram_percent");
    }

    #[test]
    fn zero_max_vms_per_host_is_rejected() {
        let req = MigrationRequest {
            max_vms_per_host: Some(0),
            ..with_source()
        };
        assert_eq!(req.validate().unwrap_err().field, "max_vms_per_host");
    }

    #[test]
    fn request_parses_from_json() {
        let json = r#"{ "source_host": "pve1", "vm_count": 3, "exclude_hosts": ["pve4"] }"#;
        let req: MigrationRequest = serde_json::from_str(json).unwrap();
        let constraints = req.validate().unwrap();
        assert_eq!(constraints.mode, SelectionMode::Count { count: 3 });
        assert!(constraints.is_excluded("pve4"));
    }
}

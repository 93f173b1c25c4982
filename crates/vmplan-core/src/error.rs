//! Planner error types.

use thiserror::Error;

/// Result type alias for planning operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// A malformed or missing request parameter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    /// Offending request field.
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that abort a planning run.
///
/// A VM without a legal destination is not an error: it is reported in
/// the plan's unplaced list.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("source host not found: {0}")]
    SourceHostNotFound(String),

    #[error("cluster snapshot contains no hosts")]
    EmptyCluster,

    #[error("insufficient nodes: {eligible} eligible online host(s), need at least 2")]
    InsufficientNodes { eligible: usize },

    #[error("no beneficial plan: {0}")]
    NoBeneficialPlan(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_field() {
        let err = ValidationError::new("storage_target_bytes", "storage amount must be > 0");
        assert_eq!(
            err.to_string(),
            "invalid storage_target_bytes: storage amount must be > 0"
        );
    }

    #[test]
    fn validation_converts_into_plan_error() {
        let err: PlanError = ValidationError::new("vm_count", "vm count must be > 0").into();
        assert!(matches!(err, PlanError::Validation(_)));
        assert_eq!(err.to_string(), "invalid vm_count: vm count must be > 0");
    }

    #[test]
    fn insufficient_nodes_reports_count() {
        let err = PlanError::InsufficientNodes { eligible: 1 };
        assert!(err.to_string().contains("1 eligible"));
    }
}

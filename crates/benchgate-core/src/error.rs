//! Validation error taxonomy.
//!
//! Structural errors (`Schema`, `UnknownInstance`) are raised before any
//! image is built. Pipeline errors are captured per instance and attached
//! to that instance's report; they never abort the batch.

use serde::{Deserialize, Serialize};

use crate::layer_key::Layer;

/// Errors produced while validating a single data point.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    /// Data point file is missing a required field or is malformed.
    #[error("invalid data point: {0}")]
    Schema(String),

    /// Instance id is not present in the authoritative dataset.
    #[error("instance id '{0}' not found in dataset")]
    UnknownInstance(String),

    /// An image layer failed to build.
    #[error("{layer} image build failed: {cause}")]
    Build { layer: Layer, cause: String },

    /// Patch did not apply cleanly to the checked-out base commit.
    #[error("patch did not apply cleanly: {0}")]
    Apply(String),

    /// Test phase exceeded its wall-clock budget.
    #[error("test phase exceeded {limit_secs}s wall-clock budget")]
    Timeout { limit_secs: u64 },

    /// Test runner crashed or produced output with no recognizable results.
    #[error("test runner error: {0}")]
    Runner(String),
}

impl ValidationError {
    /// Stable kind string reported in `ValidationReport.error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::Schema(_) => "SchemaError",
            ValidationError::UnknownInstance(_) => "UnknownInstanceError",
            ValidationError::Build { .. } => "BuildError",
            ValidationError::Apply(_) => "ApplyError",
            ValidationError::Timeout { .. } => "TimeoutError",
            ValidationError::Runner(_) => "RunnerError",
        }
    }
}

/// Serializable error attachment for a validation report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportError {
    /// Stable error kind (e.g. "ApplyError", "TimeoutError").
    pub kind: String,

    /// Human-readable message, including any raw tool output.
    pub message: String,
}

impl From<&ValidationError> for ReportError {
    fn from(err: &ValidationError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type for benchgate domain operations.
pub type Result<T> = std::result::Result<T, ValidationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(
            ValidationError::Schema("missing patch".into()).kind(),
            "SchemaError"
        );
        assert_eq!(
            ValidationError::UnknownInstance("x__y-1".into()).kind(),
            "UnknownInstanceError"
        );
        assert_eq!(
            ValidationError::Build {
                layer: Layer::Environment,
                cause: "network".into()
            }
            .kind(),
            "BuildError"
        );
        assert_eq!(ValidationError::Apply("hunk #1".into()).kind(), "ApplyError");
        assert_eq!(
            ValidationError::Timeout { limit_secs: 1800 }.kind(),
            "TimeoutError"
        );
        assert_eq!(ValidationError::Runner("crashed".into()).kind(), "RunnerError");
    }

    #[test]
    fn test_build_error_display_names_layer() {
        let err = ValidationError::Build {
            layer: Layer::Base,
            cause: "daemon unreachable".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("base"));
        assert!(msg.contains("daemon unreachable"));
    }

    #[test]
    fn test_report_error_from_validation_error() {
        let err = ValidationError::Timeout { limit_secs: 60 };
        let report_err = ReportError::from(&err);
        assert_eq!(report_err.kind, "TimeoutError");
        assert!(report_err.message.contains("60s"));
    }
}

//! Per-test outcomes, validation reports, and the result classifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReportError, ValidationError};

/// Outcome of one named test inside the patched environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestOutcome {
    /// Test identifier as listed in the data point.
    pub test_id: String,

    /// Whether the test passed.
    pub passed: bool,

    /// Diagnostic text captured from the runner, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl TestOutcome {
    /// A passing outcome.
    pub fn passed(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            passed: true,
            diagnostic: None,
        }
    }

    /// A failing outcome with a diagnostic.
    pub fn failed(test_id: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            passed: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// Pass/fail tally for one test collection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCounts {
    /// Number of tests that passed.
    pub passed: u32,

    /// Number of tests that failed.
    pub failed: u32,
}

impl TestCounts {
    /// Tally outcomes for one collection.
    pub fn tally(outcomes: &[TestOutcome]) -> Self {
        let passed = outcomes.iter().filter(|o| o.passed).count() as u32;
        Self {
            passed,
            failed: outcomes.len() as u32 - passed,
        }
    }

    /// Whether every test in the collection passed.
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Counts for both named collections, reported separately.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResults {
    pub fail_to_pass: TestCounts,
    pub pass_to_pass: TestCounts,
}

/// Final verdict for one instance. Produced exactly once per instance per
/// validation run; immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    /// Instance this report belongs to.
    pub instance_id: String,

    /// True iff every fail_to_pass and pass_to_pass outcome passed and no
    /// build/apply/execution error occurred.
    pub resolved: bool,

    /// Per-collection pass/fail tallies.
    pub test_results: TestResults,

    /// Pipeline error, if one occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,

    /// Wall-clock pipeline duration in milliseconds.
    pub duration_ms: u64,

    /// When the pipeline finished.
    pub completed_at: DateTime<Utc>,
}

impl ValidationReport {
    /// Attach the measured pipeline duration.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Classify raw outcomes into a verdict. Pure and deterministic: no
/// retries, no side effects.
///
/// A prior pipeline error (build/apply/timeout/runner) is absorbing: the
/// verdict is never `resolved`, whatever the collected outcomes say. Counts
/// still reflect whatever was collected before the error (possibly empty).
pub fn classify(
    instance_id: &str,
    fail_to_pass: &[TestOutcome],
    pass_to_pass: &[TestOutcome],
    prior_error: Option<&ValidationError>,
) -> ValidationReport {
    let test_results = TestResults {
        fail_to_pass: TestCounts::tally(fail_to_pass),
        pass_to_pass: TestCounts::tally(pass_to_pass),
    };

    let resolved = prior_error.is_none()
        && test_results.fail_to_pass.all_passed()
        && test_results.pass_to_pass.all_passed();

    ValidationReport {
        instance_id: instance_id.to_string(),
        resolved,
        test_results,
        error: prior_error.map(ReportError::from),
        duration_ms: 0,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer_key::Layer;

    fn passing(n: usize) -> Vec<TestOutcome> {
        (0..n).map(|i| TestOutcome::passed(format!("tests/t{i}"))).collect()
    }

    #[test]
    fn test_all_passed_resolves() {
        let report = classify("astropy__astropy-11693", &passing(1), &passing(27), None);
        assert!(report.resolved);
        assert_eq!(report.test_results.fail_to_pass.passed, 1);
        assert_eq!(report.test_results.fail_to_pass.failed, 0);
        assert_eq!(report.test_results.pass_to_pass.passed, 27);
        assert_eq!(report.test_results.pass_to_pass.failed, 0);
        assert!(report.error.is_none());
    }

    #[test]
    fn test_failing_fail_to_pass_is_unresolved() {
        let f2p = vec![TestOutcome::failed("tests/t0", "AssertionError")];
        let report = classify("astropy__astropy-11693", &f2p, &passing(27), None);
        assert!(!report.resolved);
        assert_eq!(report.test_results.fail_to_pass.failed, 1);
        assert_eq!(report.test_results.pass_to_pass.passed, 27);
    }

    #[test]
    fn test_regression_in_pass_to_pass_is_unresolved() {
        let mut p2p = passing(26);
        p2p.push(TestOutcome::failed("tests/t26", "regression"));
        let report = classify("x__y-1", &passing(1), &p2p, None);
        assert!(!report.resolved);
    }

    #[test]
    fn test_prior_error_is_absorbing() {
        // Outcomes all pass, but the phase timed out before finishing.
        let err = ValidationError::Timeout { limit_secs: 1800 };
        let report = classify("x__y-1", &passing(1), &passing(3), Some(&err));
        assert!(!report.resolved);
        let attached = report.error.unwrap();
        assert_eq!(attached.kind, "TimeoutError");
    }

    #[test]
    fn test_build_error_with_empty_outcomes() {
        let err = ValidationError::Build {
            layer: Layer::Environment,
            cause: "pip install failed".to_string(),
        };
        let report = classify("x__y-1", &[], &[], Some(&err));
        assert!(!report.resolved);
        assert_eq!(report.test_results.fail_to_pass, TestCounts::default());
        assert_eq!(report.error.unwrap().kind, "BuildError");
    }

    #[test]
    fn test_no_error_and_all_passed_resolves() {
        // Converse of the resolved invariant: no partial-credit gating
        // beyond the two collections and the error slot.
        let report = classify("x__y-1", &passing(3), &[], None);
        assert!(report.resolved);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let f2p = passing(2);
        let p2p = passing(3);
        let a = classify("x__y-1", &f2p, &p2p, None);
        let b = classify("x__y-1", &f2p, &p2p, None);
        assert_eq!(a.resolved, b.resolved);
        assert_eq!(a.test_results, b.test_results);
    }

    #[test]
    fn test_report_serializes_contract_shape() {
        let report = classify("x__y-1", &passing(1), &passing(2), None);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["instance_id"], "x__y-1");
        assert_eq!(json["resolved"], true);
        assert_eq!(json["test_results"]["fail_to_pass"]["passed"], 1);
        assert_eq!(json["test_results"]["pass_to_pass"]["passed"], 2);
        assert!(json.get("error").is_none());
    }
}

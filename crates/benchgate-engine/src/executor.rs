//! Test execution inside the patched instance environment.
//!
//! The two named collections run as separate invocations so their outcomes
//! are reported separately, but they share one wall-clock budget for the
//! whole phase. All parsing of the runner's free-text report is isolated
//! in [`parse_test_report`]; nothing else in the engine reads raw output.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use benchgate_core::{InstanceRecord, TestOutcome, ValidationError};
use tracing::{debug, warn};

use crate::runtime::{ContainerSession, ExecOutput, RuntimeError};

/// Runs the named test collections for one instance.
pub struct TestExecutor {
    test_command: Vec<String>,
}

impl TestExecutor {
    pub fn new(test_command: Vec<String>) -> Self {
        Self { test_command }
    }

    /// Execute `fail_to_pass` then `pass_to_pass` inside `session` under a
    /// single shared wall-clock `timeout`.
    ///
    /// On expiry the session is stopped (killing the process tree) and
    /// `TimeoutError` surfaces; outcomes already collected are discarded.
    pub async fn run(
        &self,
        session: &dyn ContainerSession,
        record: &InstanceRecord,
        timeout: Duration,
    ) -> Result<(Vec<TestOutcome>, Vec<TestOutcome>), ValidationError> {
        let deadline = Instant::now() + timeout;

        let fail_to_pass = self
            .run_collection(session, "fail_to_pass", &record.fail_to_pass, deadline, timeout)
            .await?;
        let pass_to_pass = self
            .run_collection(session, "pass_to_pass", &record.pass_to_pass, deadline, timeout)
            .await?;

        Ok((fail_to_pass, pass_to_pass))
    }

    async fn run_collection(
        &self,
        session: &dyn ContainerSession,
        collection: &str,
        test_ids: &[String],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Vec<TestOutcome>, ValidationError> {
        if test_ids.is_empty() {
            return Ok(Vec::new());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(collection, "Test phase budget exhausted before collection ran");
            session.stop().await;
            return Err(ValidationError::Timeout {
                limit_secs: timeout.as_secs(),
            });
        }

        let mut command = self.test_command.clone();
        command.extend_from_slice(test_ids);

        debug!(collection, tests = test_ids.len(), "Running test collection");
        match session.exec(&command, remaining).await {
            Ok(output) => parse_test_report(&output, test_ids),
            Err(RuntimeError::Timeout(_)) => {
                warn!(collection, "Test phase timed out, killing process tree");
                session.stop().await;
                Err(ValidationError::Timeout {
                    limit_secs: timeout.as_secs(),
                })
            }
            Err(err) => Err(ValidationError::Runner(err.to_string())),
        }
    }
}

/// Result markers emitted by the test framework's report lines.
const STATUS_MARKERS: [&str; 5] = ["PASSED", "FAILED", "ERROR", "SKIPPED", "XFAIL"];

/// Parse a runner report into per-test outcomes for the expected ids.
///
/// This is the only place that deals with the runner's unstructured text.
/// Report lines look like pytest's `-rA` summary:
///
/// ```text
/// PASSED astropy/wcs/tests/test_fitswcs.py::test_non_convergence_warning
/// FAILED astropy/wcs/tests/test_fitswcs.py::test_empty - AssertionError: ...
/// ```
///
/// A report with no recognizable markers at all is a `RunnerError`
/// (crashed runner, unparseable output). An expected id missing from an
/// otherwise parseable report is a failed outcome with a diagnostic.
pub fn parse_test_report(
    output: &ExecOutput,
    expected: &[String],
) -> Result<Vec<TestOutcome>, ValidationError> {
    let mut reported: HashMap<String, TestOutcome> = HashMap::new();

    for line in output.stdout.lines().chain(output.stderr.lines()) {
        let line = line.trim();
        let Some((status, rest)) = line.split_once(' ') else {
            continue;
        };
        if !STATUS_MARKERS.contains(&status) {
            continue;
        }

        let (test_id, diagnostic) = match rest.split_once(" - ") {
            Some((id, diag)) => (id.trim(), Some(diag.trim().to_string())),
            None => (rest.trim(), None),
        };

        let outcome = match status {
            "PASSED" => TestOutcome {
                test_id: test_id.to_string(),
                passed: true,
                diagnostic: None,
            },
            other => TestOutcome {
                test_id: test_id.to_string(),
                passed: false,
                diagnostic: diagnostic.or_else(|| Some(format!("reported as {other}"))),
            },
        };
        reported.insert(outcome.test_id.clone(), outcome);
    }

    if reported.is_empty() {
        return Err(ValidationError::Runner(format!(
            "no recognizable test results in runner output (exit code {})",
            output.exit_code
        )));
    }

    Ok(expected
        .iter()
        .map(|id| {
            reported
                .remove(id)
                .unwrap_or_else(|| TestOutcome::failed(id, "no result reported by the runner"))
        })
        .collect())
}

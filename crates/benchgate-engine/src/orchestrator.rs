//! Validation orchestration: one pipeline per instance, a bounded worker
//! pool across instances.
//!
//! Every pipeline failure is absorbed into that instance's report; nothing
//! an instance does (short of panicking the process) can prevent its
//! siblings from completing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use benchgate_core::{
    classify, Dataset, InstanceRecord, TestOutcome, ValidationConfig, ValidationError,
    ValidationReport,
};
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::builder::{BuildScheduler, InstanceEnvironment};
use crate::cache::ImageCache;
use crate::executor::TestExecutor;
use crate::patch::PatchApplicator;
use crate::runtime::{ContainerRuntime, ContainerSession};

/// Aggregate view over a batch of reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub errored: usize,
}

impl ValidationSummary {
    pub fn from_reports(reports: &[ValidationReport]) -> Self {
        let resolved = reports.iter().filter(|r| r.resolved).count();
        Self {
            total: reports.len(),
            resolved,
            unresolved: reports.len() - resolved,
            errored: reports.iter().filter(|r| r.error.is_some()).count(),
        }
    }

    pub fn all_resolved(&self) -> bool {
        self.resolved == self.total
    }
}

/// Drives validation pipelines against one container runtime and one
/// shared image cache. Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct Validator {
    config: Arc<ValidationConfig>,
    cache: Arc<ImageCache>,
    scheduler: Arc<BuildScheduler>,
    dataset: Option<Arc<Dataset>>,
}

impl Validator {
    pub fn new(
        config: ValidationConfig,
        runtime: Arc<dyn ContainerRuntime>,
        dataset: Option<Dataset>,
    ) -> Self {
        let config = Arc::new(config);
        let cache = Arc::new(ImageCache::new(Arc::clone(&runtime)));
        let scheduler = Arc::new(BuildScheduler::new(
            Arc::clone(&config),
            runtime,
            Arc::clone(&cache),
        ));
        Self {
            config,
            cache,
            scheduler,
            dataset: dataset.map(Arc::new),
        }
    }

    /// Validate one instance end to end. Never fails: every pipeline error
    /// becomes the report's error slot and an unresolved verdict.
    pub async fn validate_instance(&self, record: &InstanceRecord) -> ValidationReport {
        let started = Instant::now();
        let span = info_span!("validate", instance_id = %record.instance_id);

        async {
            let (fail_to_pass, pass_to_pass, pipeline_error) = self.run_pipeline(record).await;

            let report = classify(
                &record.instance_id,
                &fail_to_pass,
                &pass_to_pass,
                pipeline_error.as_ref(),
            )
            .with_duration(started.elapsed().as_millis() as u64);

            match &report.error {
                Some(err) => warn!(
                    resolved = report.resolved,
                    error_kind = %err.kind,
                    duration_ms = report.duration_ms,
                    "Instance validation finished with error"
                ),
                None => info!(
                    resolved = report.resolved,
                    f2p_passed = report.test_results.fail_to_pass.passed,
                    f2p_failed = report.test_results.fail_to_pass.failed,
                    p2p_passed = report.test_results.pass_to_pass.passed,
                    p2p_failed = report.test_results.pass_to_pass.failed,
                    duration_ms = report.duration_ms,
                    "Instance validation finished"
                ),
            }
            report
        }
        .instrument(span)
        .await
    }

    /// Validate a batch under the configured worker limit.
    ///
    /// Reports come back in input order. A panicked worker is reported as
    /// a `RunnerError` for its own instance; the rest of the batch is
    /// unaffected.
    pub async fn validate_all(&self, records: Vec<InstanceRecord>) -> Vec<ValidationReport> {
        let run_id = Uuid::new_v4();
        let workers = self.config.max_workers.max(1);
        info!(
            run_id = %run_id,
            instances = records.len(),
            max_workers = workers,
            "Starting validation run"
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(records.len());

        for record in records {
            let validator = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let instance_id = record.instance_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("validation semaphore closed");
                validator.validate_instance(&record).await
            });
            handles.push((instance_id, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (instance_id, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(join_err) => {
                    error!(
                        run_id = %run_id,
                        instance_id = %instance_id,
                        error = %join_err,
                        "Validation worker panicked"
                    );
                    let err = ValidationError::Runner(format!("worker panicked: {join_err}"));
                    classify(&instance_id, &[], &[], Some(&err))
                }
            };
            reports.push(report);
        }

        let summary = ValidationSummary::from_reports(&reports);
        info!(
            run_id = %run_id,
            total = summary.total,
            resolved = summary.resolved,
            unresolved = summary.unresolved,
            errored = summary.errored,
            "Validation run finished"
        );
        reports
    }

    /// Build, apply, and execute for one instance. Returns whatever
    /// outcomes were collected plus the first error encountered, if any.
    async fn run_pipeline(
        &self,
        record: &InstanceRecord,
    ) -> (Vec<TestOutcome>, Vec<TestOutcome>, Option<ValidationError>) {
        if let Some(dataset) = &self.dataset {
            if !dataset.contains(&record.instance_id) {
                return (
                    Vec::new(),
                    Vec::new(),
                    Some(ValidationError::UnknownInstance(
                        record.instance_id.clone(),
                    )),
                );
            }
        }

        let environment = match self.scheduler.build_instance_environment(record).await {
            Ok(environment) => environment,
            Err(err) => return (Vec::new(), Vec::new(), Some(err)),
        };

        let result = self.run_in_environment(record, &environment).await;
        self.release_environment(&environment).await;

        match result {
            Ok((fail_to_pass, pass_to_pass)) => (fail_to_pass, pass_to_pass, None),
            Err(err) => (Vec::new(), Vec::new(), Some(err)),
        }
    }

    async fn run_in_environment(
        &self,
        record: &InstanceRecord,
        environment: &InstanceEnvironment,
    ) -> Result<(Vec<TestOutcome>, Vec<TestOutcome>), ValidationError> {
        let session = self
            .scheduler
            .runtime()
            .start_session(&environment.instance.image)
            .await
            .map_err(|e| ValidationError::Build {
                layer: environment.instance.key.layer,
                cause: format!("failed to start container: {e}"),
            })?;

        let result = self.apply_and_test(record, session.as_ref()).await;
        session.stop().await;
        result
    }

    async fn apply_and_test(
        &self,
        record: &InstanceRecord,
        session: &dyn ContainerSession,
    ) -> Result<(Vec<TestOutcome>, Vec<TestOutcome>), ValidationError> {
        PatchApplicator::apply(session).await?;

        let timeout = Duration::from_secs(self.config.timeout_for_instance(&record.instance_id));
        let executor = TestExecutor::new(self.config.test_command.clone());
        executor.run(session, record, timeout).await
    }

    async fn release_environment(&self, environment: &InstanceEnvironment) {
        // Most specific first so the ephemeral instance layer is dropped
        // before its parents lose their references.
        for key in environment.keys().into_iter().rev() {
            self.cache.release(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchgate_core::{ReportError, TestCounts, TestResults};
    use chrono::Utc;

    fn report(instance_id: &str, resolved: bool, error: Option<&str>) -> ValidationReport {
        ValidationReport {
            instance_id: instance_id.to_string(),
            resolved,
            test_results: TestResults::default(),
            error: error.map(|kind| ReportError {
                kind: kind.to_string(),
                message: String::new(),
            }),
            duration_ms: 0,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_summary_tallies() {
        let reports = vec![
            report("a__b-1", true, None),
            report("a__b-2", false, None),
            report("a__b-3", false, Some("TimeoutError")),
        ];
        let summary = ValidationSummary::from_reports(&reports);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.unresolved, 2);
        assert_eq!(summary.errored, 1);
        assert!(!summary.all_resolved());
    }

    #[test]
    fn test_empty_batch_is_all_resolved() {
        let summary = ValidationSummary::from_reports(&[]);
        assert!(summary.all_resolved());
    }

    #[test]
    fn test_counts_default_empty() {
        assert!(TestCounts::default().all_passed());
    }
}

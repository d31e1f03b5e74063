//! In-memory fakes for deterministic engine tests.
//!
//! `ScriptedRuntime` stands in for the container runtime: it records every
//! build invocation, replays planned build failures, and answers apply/test
//! executions from per-instance scripts instead of running anything.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use benchgate_core::Layer;

use crate::runtime::{
    ContainerRuntime, ContainerSession, ExecOutput, ImageBuildRequest, ImageRef, RuntimeError,
};

/// One recorded image build.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub layer: Layer,
    pub tag: String,
}

#[derive(Debug, Default, Clone)]
struct InstanceScript {
    apply_failure: Option<String>,
    failing_tests: HashSet<String>,
    test_delay: Option<Duration>,
    runner_output: Option<(String, i32)>,
}

#[derive(Default)]
struct Inner {
    build_log: Vec<BuildRecord>,
    removed_images: Vec<String>,
    planned_failures: HashMap<Layer, VecDeque<RuntimeError>>,
    tag_failures: Vec<(String, RuntimeError)>,
    build_delay: Option<Duration>,
    scripts: HashMap<String, InstanceScript>,
    stopped_sessions: usize,
}

/// Scripted, in-memory container runtime.
///
/// Default behavior: every build succeeds, every patch applies cleanly,
/// every test passes.
#[derive(Default)]
pub struct ScriptedRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake runtime poisoned")
    }

    /// Queue build errors for a layer, consumed one per build attempt.
    pub fn plan_build_failures(&self, layer: Layer, errors: Vec<RuntimeError>) {
        self.lock()
            .planned_failures
            .entry(layer)
            .or_default()
            .extend(errors);
    }

    /// Fail the next build whose tag contains `tag_fragment`. Unlike
    /// [`ScriptedRuntime::plan_build_failures`] this pins the failure to one
    /// image, which keeps concurrent batches deterministic.
    pub fn script_build_failure_for_tag(&self, tag_fragment: &str, error: RuntimeError) {
        self.lock()
            .tag_failures
            .push((tag_fragment.to_string(), error));
    }

    /// Delay every build by `delay` (for overlap-sensitive tests).
    pub fn set_build_delay(&self, delay: Duration) {
        self.lock().build_delay = Some(delay);
    }

    /// Make the patch apply fail for `instance_id` with the given tool output.
    pub fn script_apply_failure(&self, instance_id: &str, output: &str) {
        self.lock()
            .scripts
            .entry(instance_id.to_string())
            .or_default()
            .apply_failure = Some(output.to_string());
    }

    /// Make the listed tests fail for `instance_id`; all others pass.
    pub fn script_failing_tests(&self, instance_id: &str, test_ids: &[&str]) {
        self.lock()
            .scripts
            .entry(instance_id.to_string())
            .or_default()
            .failing_tests
            .extend(test_ids.iter().map(|s| s.to_string()));
    }

    /// Delay test executions for `instance_id` (triggers the phase timeout
    /// when the delay exceeds the remaining budget).
    pub fn script_test_delay(&self, instance_id: &str, delay: Duration) {
        self.lock()
            .scripts
            .entry(instance_id.to_string())
            .or_default()
            .test_delay = Some(delay);
    }

    /// Replace the runner's report for `instance_id` with raw output and an
    /// exit code (for crashed/unparseable-runner scenarios).
    pub fn script_runner_output(&self, instance_id: &str, stdout: &str, exit_code: i32) {
        self.lock()
            .scripts
            .entry(instance_id.to_string())
            .or_default()
            .runner_output = Some((stdout.to_string(), exit_code));
    }

    /// Every build performed, in order.
    pub fn build_log(&self) -> Vec<BuildRecord> {
        self.lock().build_log.clone()
    }

    /// Number of builds performed for one layer.
    pub fn builds_for_layer(&self, layer: Layer) -> usize {
        self.lock()
            .build_log
            .iter()
            .filter(|b| b.layer == layer)
            .count()
    }

    /// Tags of images removed through the runtime.
    pub fn removed_images(&self) -> Vec<String> {
        self.lock().removed_images.clone()
    }

    /// Number of sessions that were stopped.
    pub fn stopped_session_count(&self) -> usize {
        self.lock().stopped_sessions
    }
}

/// Extract the instance id from an image tag like
/// "benchgate/astropy__astropy-11693:3f9a2c1b04de".
fn instance_id_from_tag(tag: &str) -> String {
    let name = tag.strip_prefix("benchgate/").unwrap_or(tag);
    name.split(':').next().unwrap_or(name).to_string()
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn build_image(&self, request: &ImageBuildRequest) -> Result<ImageRef, RuntimeError> {
        let (planned, delay) = {
            let mut inner = self.lock();
            inner.build_log.push(BuildRecord {
                layer: request.layer,
                tag: request.tag.clone(),
            });
            let tag_hit = inner
                .tag_failures
                .iter()
                .position(|(fragment, _)| request.tag.contains(fragment))
                .map(|i| inner.tag_failures.remove(i).1);
            let planned = tag_hit.or_else(|| {
                inner
                    .planned_failures
                    .get_mut(&request.layer)
                    .and_then(|queue| queue.pop_front())
            });
            (planned, inner.build_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = planned {
            return Err(err);
        }
        Ok(ImageRef::new(request.tag.clone()))
    }

    async fn start_session(
        &self,
        image: &ImageRef,
    ) -> Result<Box<dyn ContainerSession>, RuntimeError> {
        Ok(Box::new(FakeSession {
            inner: Arc::clone(&self.inner),
            instance_id: instance_id_from_tag(&image.tag),
            stopped: AtomicBool::new(false),
            execs: AtomicUsize::new(0),
        }))
    }

    async fn remove_image(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        self.lock().removed_images.push(image.tag.clone());
        Ok(())
    }
}

/// Fake container session answering from the runtime's scripts.
pub struct FakeSession {
    inner: Arc<Mutex<Inner>>,
    instance_id: String,
    stopped: AtomicBool,
    execs: AtomicUsize,
}

impl FakeSession {
    /// A standalone session for unit tests that skip the build chain.
    pub fn for_instance(runtime: &Arc<ScriptedRuntime>, instance_id: &str) -> Self {
        Self {
            inner: Arc::clone(&runtime.inner),
            instance_id: instance_id.to_string(),
            stopped: AtomicBool::new(false),
            execs: AtomicUsize::new(0),
        }
    }

    /// Whether `stop` was called on this session.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of `exec` calls made against this session.
    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    fn script(&self) -> InstanceScript {
        self.inner
            .lock()
            .expect("fake runtime poisoned")
            .scripts
            .get(&self.instance_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerSession for FakeSession {
    async fn exec(
        &self,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, RuntimeError> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        let script = self.script();

        // Patch apply invocation.
        if command.first().map(String::as_str) == Some("git")
            && command.iter().any(|a| a == "apply")
        {
            return Ok(match &script.apply_failure {
                Some(output) => ExecOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: output.clone(),
                    duration_ms: 1,
                },
                None => ExecOutput {
                    exit_code: 0,
                    stdout: "Applied patch cleanly".to_string(),
                    stderr: String::new(),
                    duration_ms: 1,
                },
            });
        }

        // Test invocation: anything containing "::" is a test id.
        if let Some(delay) = script.test_delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(RuntimeError::Timeout(timeout));
            }
            tokio::time::sleep(delay).await;
        }

        if let Some((stdout, exit_code)) = &script.runner_output {
            return Ok(ExecOutput {
                exit_code: *exit_code,
                stdout: stdout.clone(),
                stderr: String::new(),
                duration_ms: 1,
            });
        }

        let test_ids: Vec<&String> = command.iter().filter(|a| a.contains("::")).collect();
        let mut lines = Vec::new();
        let mut any_failed = false;
        for id in test_ids {
            if script.failing_tests.contains(id.as_str()) {
                any_failed = true;
                lines.push(format!("FAILED {id} - scripted failure"));
            } else {
                lines.push(format!("PASSED {id}"));
            }
        }

        Ok(ExecOutput {
            exit_code: i32::from(any_failed),
            stdout: lines.join("\n"),
            stderr: String::new(),
            duration_ms: 1,
        })
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.inner
                .lock()
                .expect("fake runtime poisoned")
                .stopped_sessions += 1;
        }
    }
}

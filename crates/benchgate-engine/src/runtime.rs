//! Container runtime contract and the Docker CLI implementation.
//!
//! The engine never talks to a container daemon directly; everything goes
//! through [`ContainerRuntime`] / [`ContainerSession`] so tests can swap in
//! the scripted fake from [`crate::fakes`].

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use benchgate_core::Layer;
use tokio::process::Command;
use tracing::{debug, warn};

/// Working directory inside every evaluation container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Handle to a built image, addressed by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Full image tag, e.g. "benchgate/env:3f9a2c1b04de".
    pub tag: String,
}

impl ImageRef {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

/// A file staged into an image's build context.
#[derive(Debug, Clone)]
pub struct StagedFile {
    /// File name inside the build context.
    pub name: String,

    /// Destination path inside the image.
    pub dest: String,

    /// File content.
    pub content: String,
}

/// Everything needed to build one image layer.
#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    /// Tag for the built image.
    pub tag: String,

    /// Which layer this image belongs to.
    pub layer: Layer,

    /// Image the build starts from: the parent layer's tag, or the
    /// configured OS image for the base layer.
    pub from: String,

    /// Files staged into the image before the steps run.
    pub files: Vec<StagedFile>,

    /// Shell steps executed during the build, in order.
    pub steps: Vec<String>,
}

/// Captured output of one command execution inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Process exit code (-1 when unknown).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecOutput {
    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr combined for diagnostics.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Errors surfaced by the container runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// The daemon could not be reached. Transient: retried at build time.
    #[error("container daemon unavailable: {0}")]
    Unavailable(String),

    /// The runtime binary could not be spawned or piped. Transient.
    #[error("runtime io error: {0}")]
    Io(String),

    /// A command inside the runtime exited non-zero in a way that is not
    /// expected to change on retry.
    #[error("{context}: {detail}")]
    CommandFailed { context: String, detail: String },

    /// An execution exceeded its wall-clock budget.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

impl RuntimeError {
    /// Whether retrying could plausibly succeed (infrastructure trouble
    /// rather than deterministic command failure).
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_) | RuntimeError::Io(_))
    }
}

/// Contract the engine consumes from the container/image runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from the request, returning a reusable handle.
    async fn build_image(&self, request: &ImageBuildRequest) -> Result<ImageRef, RuntimeError>;

    /// Start a long-lived container from an image. The session keeps its
    /// filesystem across `exec` calls until stopped.
    async fn start_session(&self, image: &ImageRef)
        -> Result<Box<dyn ContainerSession>, RuntimeError>;

    /// Remove a built image. Used by the cache when evicting.
    async fn remove_image(&self, image: &ImageRef) -> Result<(), RuntimeError>;
}

/// One running container with a persistent filesystem.
#[async_trait]
pub trait ContainerSession: Send + Sync {
    /// Execute a command in the container under a wall-clock timeout.
    /// On expiry the process tree is killed and `RuntimeError::Timeout`
    /// is returned.
    async fn exec(&self, command: &[String], timeout: Duration)
        -> Result<ExecOutput, RuntimeError>;

    /// Stop the container, killing anything still running. Best-effort.
    async fn stop(&self);
}

/// Runtime backed by the `docker` CLI.
pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    async fn run_docker(&self, args: &[String]) -> Result<ExecOutput, RuntimeError> {
        let start = Instant::now();
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::Io(format!("failed to run {}: {e}", self.binary)))?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() && stderr.contains("Cannot connect to the Docker daemon") {
            return Err(RuntimeError::Unavailable(stderr.trim().to_string()));
        }

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the Dockerfile for a build request.
fn render_dockerfile(request: &ImageBuildRequest) -> String {
    let mut lines = vec![format!("FROM {}", request.from)];
    if request.layer != Layer::Base {
        lines.push(format!("WORKDIR {CONTAINER_WORKDIR}"));
    }
    for file in &request.files {
        lines.push(format!("COPY {} {}", file.name, file.dest));
    }
    for step in &request.steps {
        lines.push(format!("RUN {step}"));
    }
    lines.join("\n") + "\n"
}

/// Write the build context (Dockerfile plus staged files) to a directory.
fn write_build_context(dir: &Path, request: &ImageBuildRequest) -> Result<(), RuntimeError> {
    std::fs::write(dir.join("Dockerfile"), render_dockerfile(request))
        .map_err(|e| RuntimeError::Io(format!("write Dockerfile: {e}")))?;
    for file in &request.files {
        std::fs::write(dir.join(&file.name), &file.content)
            .map_err(|e| RuntimeError::Io(format!("write {}: {e}", file.name)))?;
    }
    Ok(())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, request: &ImageBuildRequest) -> Result<ImageRef, RuntimeError> {
        let context = tempfile::tempdir()
            .map_err(|e| RuntimeError::Io(format!("create build context: {e}")))?;
        write_build_context(context.path(), request)?;

        debug!(tag = %request.tag, layer = %request.layer, "Building image");
        let output = self
            .run_docker(&[
                "build".to_string(),
                "-t".to_string(),
                request.tag.clone(),
                context.path().display().to_string(),
            ])
            .await?;

        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                context: format!("docker build {}", request.tag),
                detail: output.combined(),
            });
        }

        Ok(ImageRef::new(request.tag.clone()))
    }

    async fn start_session(
        &self,
        image: &ImageRef,
    ) -> Result<Box<dyn ContainerSession>, RuntimeError> {
        let output = self
            .run_docker(&[
                "run".to_string(),
                "-d".to_string(),
                "--rm".to_string(),
                "-w".to_string(),
                CONTAINER_WORKDIR.to_string(),
                image.tag.clone(),
                "sleep".to_string(),
                "infinity".to_string(),
            ])
            .await?;

        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                context: format!("docker run {}", image.tag),
                detail: output.combined(),
            });
        }

        let container_id = output.stdout.trim().to_string();
        debug!(image = %image.tag, container = %container_id, "Started session");
        Ok(Box::new(DockerSession {
            binary: self.binary.clone(),
            container_id,
        }))
    }

    async fn remove_image(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        let output = self
            .run_docker(&["rmi".to_string(), "-f".to_string(), image.tag.clone()])
            .await?;
        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                context: format!("docker rmi {}", image.tag),
                detail: output.combined(),
            });
        }
        Ok(())
    }
}

/// Session backed by `docker exec` against a detached container.
struct DockerSession {
    binary: String,
    container_id: String,
}

#[async_trait]
impl ContainerSession for DockerSession {
    async fn exec(
        &self,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, RuntimeError> {
        let start = Instant::now();
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
            self.container_id.clone(),
        ];
        args.extend_from_slice(command);

        let child = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::Io(format!("failed to spawn docker exec: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| RuntimeError::Io(format!("docker exec wait: {e}")))?
            }
            Err(_elapsed) => {
                // Kill the whole container so the process tree dies with it.
                self.stop().await;
                return Err(RuntimeError::Timeout(timeout));
            }
        };

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn stop(&self) {
        let result = Command::new(&self.binary)
            .args(["rm", "-f", &self.container_id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(container = %self.container_id, error = %e, "Failed to stop container");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ImageBuildRequest {
        ImageBuildRequest {
            tag: "benchgate/env:abc123".to_string(),
            layer: Layer::Environment,
            from: "benchgate/base:def456".to_string(),
            files: vec![StagedFile {
                name: "requirements.txt".to_string(),
                dest: "/tmp/requirements.txt".to_string(),
                content: "numpy\n".to_string(),
            }],
            steps: vec!["pip install -r /tmp/requirements.txt".to_string()],
        }
    }

    #[test]
    fn test_render_dockerfile_ordering() {
        let dockerfile = render_dockerfile(&sample_request());
        let from_pos = dockerfile.find("FROM benchgate/base:def456").unwrap();
        let workdir_pos = dockerfile.find("WORKDIR /workspace").unwrap();
        let copy_pos = dockerfile
            .find("COPY requirements.txt /tmp/requirements.txt")
            .unwrap();
        let run_pos = dockerfile.find("RUN pip install").unwrap();
        assert!(from_pos < workdir_pos);
        assert!(workdir_pos < copy_pos);
        assert!(copy_pos < run_pos);
    }

    #[test]
    fn test_render_dockerfile_base_layer_has_no_workdir() {
        let mut request = sample_request();
        request.layer = Layer::Base;
        request.from = "ubuntu:22.04".to_string();
        let dockerfile = render_dockerfile(&request);
        assert!(dockerfile.starts_with("FROM ubuntu:22.04"));
        assert!(!dockerfile.contains("WORKDIR"));
    }

    #[test]
    fn test_write_build_context_stages_files() {
        let dir = tempfile::tempdir().unwrap();
        write_build_context(dir.path(), &sample_request()).unwrap();
        assert!(dir.path().join("Dockerfile").exists());
        let staged = std::fs::read_to_string(dir.path().join("requirements.txt")).unwrap();
        assert_eq!(staged, "numpy\n");
    }

    #[test]
    fn test_exec_output_combined() {
        let output = ExecOutput {
            exit_code: 1,
            stdout: "hunk failed".to_string(),
            stderr: "error: patch fragment".to_string(),
            duration_ms: 5,
        };
        assert!(!output.success());
        let combined = output.combined();
        assert!(combined.contains("hunk failed"));
        assert!(combined.contains("patch fragment"));
    }

    #[test]
    fn test_runtime_error_transience() {
        assert!(RuntimeError::Unavailable("daemon down".into()).is_transient());
        assert!(RuntimeError::Io("broken pipe".into()).is_transient());
        assert!(!RuntimeError::CommandFailed {
            context: "docker build".into(),
            detail: "bad Dockerfile".into()
        }
        .is_transient());
        assert!(!RuntimeError::Timeout(Duration::from_secs(1)).is_transient());
    }
}

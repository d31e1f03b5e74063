//! Validation engine: container runtime plumbing, the layer-keyed image
//! cache, build scheduling, patch application, test execution, and the
//! orchestrator that ties one pipeline per instance into a bounded pool.

pub mod builder;
pub mod cache;
pub mod executor;
pub mod fakes;
pub mod orchestrator;
pub mod patch;
pub mod runtime;
pub mod telemetry;

pub use builder::{BuildScheduler, InstanceEnvironment};
pub use cache::{BuiltImage, CacheTier, ImageCache};
pub use executor::TestExecutor;
pub use orchestrator::{ValidationSummary, Validator};
pub use patch::{PatchApplicator, PATCH_PATH};
pub use runtime::{
    ContainerRuntime, ContainerSession, DockerRuntime, ExecOutput, ImageBuildRequest, ImageRef,
    RuntimeError, StagedFile, CONTAINER_WORKDIR,
};

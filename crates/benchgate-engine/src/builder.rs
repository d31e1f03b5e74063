//! Layer build scheduling: Base -> Environment -> Instance, through the
//! image cache, with bounded retry for transient infrastructure failures.

use std::sync::Arc;
use std::time::Duration;

use benchgate_core::{manifest_digest, InstanceRecord, Layer, LayerKey, ValidationConfig, ValidationError};
use tracing::{debug, warn};

use crate::cache::{BuiltImage, ImageCache};
use crate::patch::PATCH_PATH;
use crate::runtime::{ContainerRuntime, ImageBuildRequest, ImageRef, StagedFile, CONTAINER_WORKDIR};

/// The three built layers backing one instance pipeline. Holds one cache
/// reference per layer; the orchestrator releases them when the pipeline
/// completes.
#[derive(Debug, Clone)]
pub struct InstanceEnvironment {
    pub base: BuiltImage,
    pub environment: BuiltImage,
    pub instance: BuiltImage,
}

impl InstanceEnvironment {
    /// Keys of all held layers, least specific first.
    pub fn keys(&self) -> [&LayerKey; 3] {
        [&self.base.key, &self.environment.key, &self.instance.key]
    }
}

/// Builds the three-layer chain for one instance record.
pub struct BuildScheduler {
    config: Arc<ValidationConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<ImageCache>,
}

impl BuildScheduler {
    pub fn new(
        config: Arc<ValidationConfig>,
        runtime: Arc<dyn ContainerRuntime>,
        cache: Arc<ImageCache>,
    ) -> Self {
        Self {
            config,
            runtime,
            cache,
        }
    }

    /// Runtime the built images live in.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Resolve and build Base -> Environment -> Instance for `record`.
    ///
    /// Each layer goes through the cache, so concurrent pipelines sharing a
    /// key converge on one build. A failure aborts the chain for this
    /// instance only and releases any layers already acquired.
    pub async fn build_instance_environment(
        &self,
        record: &InstanceRecord,
    ) -> Result<InstanceEnvironment, ValidationError> {
        let force = self.config.force_rebuild;

        let base_key = LayerKey::base(&self.config.base_image, &self.config.runtime_spec);
        let base = self
            .cache
            .get_or_build(&base_key, force, || {
                self.build_layer(self.base_request(&base_key), true)
            })
            .await?;

        let manifest = manifest_digest(record.env_manifest.as_deref(), &record.base_commit);
        let env_key = LayerKey::environment(&base_key, &record.repo, &manifest);
        let environment = match self
            .cache
            .get_or_build(&env_key, force, || {
                self.build_layer(self.environment_request(&env_key, record, &base.image), true)
            })
            .await
        {
            Ok(image) => image,
            Err(err) => {
                self.cache.release(&base_key).await;
                return Err(err);
            }
        };

        // Patch content is deterministic: an instance build failure gains
        // nothing from retry.
        let instance_key = LayerKey::instance(&env_key, &record.instance_id, &record.patch);
        let instance = match self
            .cache
            .get_or_build(&instance_key, force, || {
                self.build_layer(
                    self.instance_request(&instance_key, record, &environment.image),
                    false,
                )
            })
            .await
        {
            Ok(image) => image,
            Err(err) => {
                self.cache.release(&env_key).await;
                self.cache.release(&base_key).await;
                return Err(err);
            }
        };

        debug!(
            instance_id = %record.instance_id,
            instance_image = %instance.image.tag,
            "Layer chain ready"
        );

        Ok(InstanceEnvironment {
            base,
            environment,
            instance,
        })
    }

    /// Run one image build, retrying transient runtime errors with bounded
    /// exponential backoff when `retryable` is set.
    async fn build_layer(
        &self,
        request: ImageBuildRequest,
        retryable: bool,
    ) -> Result<ImageRef, ValidationError> {
        let max_attempts = if retryable {
            self.config.build_retries + 1
        } else {
            1
        };

        let mut attempt = 1u32;
        loop {
            match self.runtime.build_image(&request).await {
                Ok(image) => return Ok(image),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = Duration::from_millis(
                        self.config.retry_backoff_ms * 2u64.pow(attempt - 1),
                    );
                    warn!(
                        tag = %request.tag,
                        attempt,
                        error = %err,
                        "Transient build failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(ValidationError::Build {
                        layer: request.layer,
                        cause: err.to_string(),
                    })
                }
            }
        }
    }

    /// Base layer: OS image plus VCS and runtime toolchain.
    fn base_request(&self, key: &LayerKey) -> ImageBuildRequest {
        ImageBuildRequest {
            tag: format!("benchgate/base:{}", key.short()),
            layer: Layer::Base,
            from: self.config.base_image.clone(),
            files: Vec::new(),
            steps: vec![
                "apt-get update && apt-get install -y --no-install-recommends \
                 git ca-certificates build-essential python3 python3-pip python3-venv"
                    .to_string(),
                "ln -sf /usr/bin/python3 /usr/local/bin/python".to_string(),
            ],
        }
    }

    /// Environment layer: repository checkout at the base commit plus
    /// installed dependencies.
    fn environment_request(
        &self,
        key: &LayerKey,
        record: &InstanceRecord,
        base: &ImageRef,
    ) -> ImageBuildRequest {
        let mut files = Vec::new();
        let mut steps = vec![
            format!("git clone https://github.com/{} {CONTAINER_WORKDIR}", record.repo),
            format!("git checkout {}", record.base_commit),
        ];

        if let Some(manifest) = &record.env_manifest {
            files.push(StagedFile {
                name: "requirements.txt".to_string(),
                dest: "/tmp/requirements.txt".to_string(),
                content: manifest.clone(),
            });
            steps.push("pip install -r /tmp/requirements.txt".to_string());
        }
        steps.push("pip install -e .".to_string());

        ImageBuildRequest {
            tag: format!("benchgate/env:{}", key.short()),
            layer: Layer::Environment,
            from: base.tag.clone(),
            files,
            steps,
        }
    }

    /// Instance layer: the candidate patch staged into the environment.
    /// Applying it happens in the pipeline's apply stage, not here.
    fn instance_request(
        &self,
        key: &LayerKey,
        record: &InstanceRecord,
        environment: &ImageRef,
    ) -> ImageBuildRequest {
        ImageBuildRequest {
            tag: format!("benchgate/{}:{}", record.instance_id, key.short()),
            layer: Layer::Instance,
            from: environment.tag.clone(),
            files: vec![StagedFile {
                name: "patch.diff".to_string(),
                dest: PATCH_PATH.to_string(),
                content: record.patch.clone(),
            }],
            steps: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedRuntime;
    use crate::runtime::RuntimeError;

    fn record(instance_id: &str, patch: &str) -> InstanceRecord {
        InstanceRecord {
            instance_id: instance_id.to_string(),
            repo: "astropy/astropy".to_string(),
            base_commit: "3832210580d5".to_string(),
            patch: patch.to_string(),
            fail_to_pass: vec!["tests/test_a.py::t1".to_string()],
            pass_to_pass: vec![],
            env_manifest: None,
        }
    }

    fn scheduler(
        runtime: Arc<ScriptedRuntime>,
        config: ValidationConfig,
    ) -> (BuildScheduler, Arc<ImageCache>) {
        let runtime_dyn: Arc<dyn ContainerRuntime> = runtime;
        let cache = Arc::new(ImageCache::new(Arc::clone(&runtime_dyn)));
        (
            BuildScheduler::new(Arc::new(config), runtime_dyn, Arc::clone(&cache)),
            cache,
        )
    }

    fn fast_config() -> ValidationConfig {
        ValidationConfig {
            retry_backoff_ms: 1,
            ..ValidationConfig::default()
        }
    }

    #[tokio::test]
    async fn test_layers_built_in_dependency_order() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (scheduler, _cache) = scheduler(Arc::clone(&runtime), fast_config());

        let env = scheduler
            .build_instance_environment(&record("astropy__astropy-11693", "diff"))
            .await
            .unwrap();

        let layers: Vec<Layer> = runtime.build_log().iter().map(|b| b.layer).collect();
        assert_eq!(layers, vec![Layer::Base, Layer::Environment, Layer::Instance]);
        assert!(env.instance.image.tag.contains("astropy__astropy-11693"));
    }

    #[tokio::test]
    async fn test_environment_layer_shared_across_instances() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (scheduler, _cache) = scheduler(Arc::clone(&runtime), fast_config());

        scheduler
            .build_instance_environment(&record("astropy__astropy-11693", "golden diff"))
            .await
            .unwrap();
        scheduler
            .build_instance_environment(&record("astropy__astropy-11693", "bad diff"))
            .await
            .unwrap();

        assert_eq!(runtime.builds_for_layer(Layer::Base), 1);
        assert_eq!(
            runtime.builds_for_layer(Layer::Environment),
            1,
            "same repo/base_commit must share one environment build"
        );
        assert_eq!(
            runtime.builds_for_layer(Layer::Instance),
            2,
            "different patches diverge at the instance layer"
        );
    }

    #[tokio::test]
    async fn test_transient_base_failure_retried() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.plan_build_failures(
            Layer::Base,
            vec![RuntimeError::Unavailable("daemon hiccup".to_string())],
        );
        let (scheduler, _cache) = scheduler(Arc::clone(&runtime), fast_config());

        scheduler
            .build_instance_environment(&record("x__y-1", "diff"))
            .await
            .unwrap();

        assert_eq!(runtime.builds_for_layer(Layer::Base), 2, "one retry expected");
    }

    #[tokio::test]
    async fn test_persistent_transient_failure_exhausts_retries() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.plan_build_failures(
            Layer::Environment,
            vec![
                RuntimeError::Unavailable("down".to_string()),
                RuntimeError::Unavailable("down".to_string()),
                RuntimeError::Unavailable("down".to_string()),
            ],
        );
        let config = ValidationConfig {
            build_retries: 2,
            ..fast_config()
        };
        let (scheduler, cache) = scheduler(Arc::clone(&runtime), config);

        let err = scheduler
            .build_instance_environment(&record("x__y-1", "diff"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "BuildError");
        assert!(err.to_string().contains("environment"));
        assert_eq!(runtime.builds_for_layer(Layer::Environment), 3);
        // Base reference taken for this pipeline was released again.
        cache.release(&LayerKey::base("ubuntu:22.04", "python-3.11")).await;
    }

    #[tokio::test]
    async fn test_fatal_failure_not_retried() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.plan_build_failures(
            Layer::Environment,
            vec![RuntimeError::CommandFailed {
                context: "docker build".to_string(),
                detail: "pip install failed".to_string(),
            }],
        );
        let (scheduler, _cache) = scheduler(Arc::clone(&runtime), fast_config());

        let err = scheduler
            .build_instance_environment(&record("x__y-1", "diff"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "BuildError");
        assert_eq!(
            runtime.builds_for_layer(Layer::Environment),
            1,
            "deterministic failures are not retried"
        );
    }

    #[tokio::test]
    async fn test_instance_failure_never_retried_even_when_transient() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.plan_build_failures(
            Layer::Instance,
            vec![RuntimeError::Unavailable("down".to_string())],
        );
        let (scheduler, _cache) = scheduler(Arc::clone(&runtime), fast_config());

        let err = scheduler
            .build_instance_environment(&record("x__y-1", "diff"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "BuildError");
        assert_eq!(runtime.builds_for_layer(Layer::Instance), 1);
    }

    #[tokio::test]
    async fn test_manifest_override_diverges_environment() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (scheduler, _cache) = scheduler(Arc::clone(&runtime), fast_config());

        let plain = record("x__y-1", "diff");
        let mut pinned = record("x__y-2", "diff");
        pinned.env_manifest = Some("numpy==1.24\n".to_string());

        scheduler.build_instance_environment(&plain).await.unwrap();
        scheduler.build_instance_environment(&pinned).await.unwrap();

        assert_eq!(
            runtime.builds_for_layer(Layer::Environment),
            2,
            "explicit manifest must change the environment key"
        );
    }
}

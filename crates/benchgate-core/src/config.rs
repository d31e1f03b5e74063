//! Validation configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default wall-clock budget for the test phase: 30 minutes.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// Configuration for a validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Wall-clock budget for the test phase, in seconds.
    pub default_timeout_secs: u64,

    /// Per-repo-family timeout overrides, keyed by the instance id prefix
    /// (e.g. "django" for "django__django-11099").
    pub timeout_overrides: HashMap<String, u64>,

    /// Bounded worker pool size for independent instance pipelines.
    pub max_workers: usize,

    /// Retries for transient Base/Environment build failures.
    pub build_retries: u32,

    /// Base delay for exponential backoff between build retries.
    pub retry_backoff_ms: u64,

    /// Bypass cache hits and rebuild every layer.
    pub force_rebuild: bool,

    /// OS image for the base layer, e.g. "ubuntu:22.04".
    pub base_image: String,

    /// Runtime toolchain spec for the base layer, e.g. "python-3.11".
    pub runtime_spec: String,

    /// Test runner invocation; test ids are appended per collection.
    pub test_command: Vec<String>,

    /// When set, one JSON report file per instance is written here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        // Repository families that routinely need more than 30 minutes.
        let timeout_overrides = HashMap::from([
            ("django".to_string(), 2400),
            ("scikit-learn".to_string(), 3000),
            ("matplotlib".to_string(), 2100),
        ]);

        Self {
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            timeout_overrides,
            max_workers: 1,
            build_retries: 2,
            retry_backoff_ms: 500,
            force_rebuild: false,
            base_image: "ubuntu:22.04".to_string(),
            runtime_spec: "python-3.11".to_string(),
            test_command: vec![
                "python".to_string(),
                "-m".to_string(),
                "pytest".to_string(),
                "-rA".to_string(),
                "--no-header".to_string(),
            ],
            report_dir: None,
        }
    }
}

impl ValidationConfig {
    /// Timeout for a specific instance, honoring per-repo overrides.
    pub fn timeout_for_instance(&self, instance_id: &str) -> u64 {
        let family = match instance_id.split_once("__") {
            Some((family, _)) => family,
            None => "default",
        };
        self.timeout_overrides
            .get(family)
            .copied()
            .unwrap_or(self.default_timeout_secs)
    }
}

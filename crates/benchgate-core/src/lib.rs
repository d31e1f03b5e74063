//! benchgate-core - Domain layer for the benchgate validation gate
//!
//! Provides the typed data point / dataset model, deterministic layer keys
//! for the image cache, the validation error taxonomy, and the pure result
//! classifier that turns raw test outcomes into a verdict.

pub mod config;
pub mod error;
pub mod instance;
pub mod layer_key;
pub mod report;

// Re-export key types
pub use config::ValidationConfig;
pub use error::{ReportError, Result, ValidationError};
pub use instance::{load_data_point, parse_test_list, Dataset, InstanceRecord};
pub use layer_key::{manifest_digest, Layer, LayerKey};
pub use report::{classify, TestCounts, TestOutcome, TestResults, ValidationReport};

//! Deterministic layer keys for the image cache.
//!
//! Each key is a hex SHA-256 over the inputs that determine an image's
//! content at that layer, with NUL framing between inputs so concatenation
//! cannot collide. Two instances with identical environment inputs map to
//! the same environment key and therefore share one build.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Image layers, from least to most specific.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// OS image plus runtime toolchain. Shared by everything.
    Base,

    /// Base plus repository checkout and installed dependencies.
    Environment,

    /// Environment plus the staged candidate patch. One per data point.
    Instance,
}

impl Layer {
    /// Layer name used in image tags and log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Base => "base",
            Layer::Environment => "environment",
            Layer::Instance => "instance",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Content-addressed key identifying one cached image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LayerKey {
    /// Which layer this key addresses.
    pub layer: Layer,

    /// Hex SHA-256 over the layer's content-determining inputs.
    pub digest: String,
}

impl LayerKey {
    /// Base layer key from the OS image and runtime toolchain spec.
    pub fn base(base_image: &str, runtime_spec: &str) -> Self {
        Self {
            layer: Layer::Base,
            digest: framed_digest(&[b"base", base_image.as_bytes(), runtime_spec.as_bytes()]),
        }
    }

    /// Environment layer key. `manifest_digest` pins the dependency
    /// manifest content; see [`manifest_digest`].
    pub fn environment(base_key: &LayerKey, repo: &str, manifest_digest: &str) -> Self {
        Self {
            layer: Layer::Environment,
            digest: framed_digest(&[
                b"env",
                base_key.digest.as_bytes(),
                repo.as_bytes(),
                manifest_digest.as_bytes(),
            ]),
        }
    }

    /// Instance layer key from the environment key, the instance id and the
    /// patch content hash. Different patches for the same instance diverge
    /// here and only here.
    pub fn instance(env_key: &LayerKey, instance_id: &str, patch: &str) -> Self {
        let patch_digest = sha256_hex(patch.as_bytes());
        Self {
            layer: Layer::Instance,
            digest: framed_digest(&[
                b"instance",
                env_key.digest.as_bytes(),
                instance_id.as_bytes(),
                patch_digest.as_bytes(),
            ]),
        }
    }

    /// Short prefix for image tags and log lines.
    pub fn short(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}

impl std::fmt::Display for LayerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.layer, self.short())
    }
}

/// Digest of the dependency-manifest content that feeds the environment key.
///
/// When the record carries an explicit manifest text, its content is hashed
/// directly. Otherwise the base commit pins the manifest files inside the
/// repository, so it stands in as the content proxy: records sharing
/// repo + base_commit share one environment image.
pub fn manifest_digest(env_manifest: Option<&str>, base_commit: &str) -> String {
    match env_manifest {
        Some(manifest) => sha256_hex(manifest.as_bytes()),
        None => sha256_hex(base_commit.as_bytes()),
    }
}

/// SHA-256 over NUL-framed input parts.
fn framed_digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_key_deterministic() {
        let a = LayerKey::base("ubuntu:22.04", "python-3.11");
        let b = LayerKey::base("ubuntu:22.04", "python-3.11");
        assert_eq!(a, b);
        assert_eq!(a.digest.len(), 64);
    }

    #[test]
    fn test_base_key_changes_with_runtime_spec() {
        let a = LayerKey::base("ubuntu:22.04", "python-3.10");
        let b = LayerKey::base("ubuntu:22.04", "python-3.11");
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_environment_key_shared_for_same_inputs() {
        let base = LayerKey::base("ubuntu:22.04", "python-3.11");
        let manifest = manifest_digest(None, "abc123");
        let a = LayerKey::environment(&base, "astropy/astropy", &manifest);
        let b = LayerKey::environment(&base, "astropy/astropy", &manifest);
        assert_eq!(a, b);
        assert_eq!(a.layer, Layer::Environment);
    }

    #[test]
    fn test_instance_key_diverges_per_patch() {
        let base = LayerKey::base("ubuntu:22.04", "python-3.11");
        let env = LayerKey::environment(&base, "astropy/astropy", &manifest_digest(None, "abc"));
        let golden = LayerKey::instance(&env, "astropy__astropy-11693", "--- a/f\n+++ b/f\n");
        let bad = LayerKey::instance(&env, "astropy__astropy-11693", "--- a/g\n+++ b/g\n");
        assert_ne!(golden.digest, bad.digest);
    }

    #[test]
    fn test_manifest_digest_prefers_explicit_manifest() {
        let from_commit = manifest_digest(None, "abc123");
        let from_manifest = manifest_digest(Some("numpy==1.24\n"), "abc123");
        assert_ne!(from_commit, from_manifest);
        // Explicit manifest ignores the commit entirely.
        assert_eq!(
            from_manifest,
            manifest_digest(Some("numpy==1.24\n"), "def456")
        );
    }

    #[test]
    fn test_framing_prevents_concatenation_collisions() {
        let a = LayerKey::base("ab", "c");
        let b = LayerKey::base("a", "bc");
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_display_uses_short_digest() {
        let key = LayerKey::base("ubuntu:22.04", "python-3.11");
        let shown = key.to_string();
        assert!(shown.starts_with("base:"));
        assert_eq!(shown.len(), "base:".len() + 12);
    }
}

//! Data point records and the authoritative dataset index.
//!
//! Data points arrive as loosely-typed JSON files; everything downstream of
//! [`load_data_point`] consumes only the validated [`InstanceRecord`] form.

use std::collections::HashMap;
use std::fs;
use std::io::BufRead;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, ValidationError};

/// Fields a data point must carry to be evaluated at all.
const REQUIRED_FIELDS: [&str; 6] = [
    "instance_id",
    "repo",
    "base_commit",
    "patch",
    "FAIL_TO_PASS",
    "PASS_TO_PASS",
];

/// One issue/patch evaluation unit. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    /// Dataset-wide unique id, e.g. "astropy__astropy-11693".
    pub instance_id: String,

    /// Source repository as "owner/name".
    pub repo: String,

    /// Commit the patch is written against.
    pub base_commit: String,

    /// Unified diff text of the candidate fix.
    pub patch: String,

    /// Tests expected to fail before the patch and pass after it.
    #[serde(alias = "FAIL_TO_PASS", deserialize_with = "deserialize_test_list")]
    pub fail_to_pass: Vec<String>,

    /// Tests expected to pass both before and after the patch.
    #[serde(alias = "PASS_TO_PASS", deserialize_with = "deserialize_test_list")]
    pub pass_to_pass: Vec<String>,

    /// Optional dependency manifest text overriding the base_commit proxy
    /// in the environment layer key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_manifest: Option<String>,
}

impl InstanceRecord {
    /// Repository family prefix of the instance id ("astropy" for
    /// "astropy__astropy-11693"), used for per-repo timeout overrides.
    pub fn repo_family(&self) -> &str {
        match self.instance_id.split_once("__") {
            Some((family, _)) => family,
            None => "default",
        }
    }
}

/// Test id collections are stored inconsistently across datasets: a JSON
/// array, a JSON-encoded string of an array, or a comma-separated string.
#[derive(Deserialize)]
#[serde(untagged)]
enum TestList {
    Items(Vec<String>),
    Raw(String),
}

fn deserialize_test_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match TestList::deserialize(deserializer)? {
        TestList::Items(items) => Ok(items),
        TestList::Raw(raw) => Ok(parse_test_list(&raw)),
    }
}

/// Parse a test list from its string encodings.
pub fn parse_test_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
            return items;
        }
    }
    trimmed
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Load and validate a data point from a JSON file.
///
/// Surfaces `SchemaError` for unreadable files, invalid JSON, and missing
/// required fields, naming every missing field in the message.
pub fn load_data_point(path: &Path) -> Result<InstanceRecord> {
    let text = fs::read_to_string(path)
        .map_err(|e| ValidationError::Schema(format!("cannot read {}: {e}", path.display())))?;

    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| ValidationError::Schema(format!("invalid JSON in {}: {e}", path.display())))?;

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .filter(|field| {
            // Lower-case spellings of the test lists are also accepted.
            let lower = field.to_lowercase();
            value.get(**field).is_none() && value.get(&lower).is_none()
        })
        .copied()
        .collect();

    if !missing.is_empty() {
        return Err(ValidationError::Schema(format!(
            "{} is missing required fields: {}",
            path.display(),
            missing.join(", ")
        )));
    }

    serde_json::from_value(value)
        .map_err(|e| ValidationError::Schema(format!("malformed data point {}: {e}", path.display())))
}

/// Authoritative index of known instances, keyed by instance id.
///
/// Membership is checked before any image is built; an id absent from the
/// dataset fails fast with `UnknownInstanceError`.
#[derive(Debug, Default)]
pub struct Dataset {
    records: HashMap<String, InstanceRecord>,
}

impl Dataset {
    /// Build a dataset from already-loaded records.
    pub fn from_records(records: Vec<InstanceRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.instance_id.clone(), r))
                .collect(),
        }
    }

    /// Load a dataset from a JSONL file, one record per line.
    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .map_err(|e| ValidationError::Schema(format!("cannot open dataset {}: {e}", path.display())))?;

        let mut records = Vec::new();
        for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line
                .map_err(|e| ValidationError::Schema(format!("dataset read error: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: InstanceRecord = serde_json::from_str(&line).map_err(|e| {
                ValidationError::Schema(format!(
                    "invalid dataset record at {}:{}: {e}",
                    path.display(),
                    lineno + 1
                ))
            })?;
            records.push(record);
        }

        Ok(Self::from_records(records))
    }

    /// Whether the dataset knows this instance id.
    pub fn contains(&self, instance_id: &str) -> bool {
        self.records.contains_key(instance_id)
    }

    /// Look up the authoritative record for an id.
    pub fn get(&self, instance_id: &str) -> Option<&InstanceRecord> {
        self.records.get(instance_id)
    }

    /// Number of indexed instances.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the dataset holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "instance_id": "astropy__astropy-11693",
            "repo": "astropy/astropy",
            "base_commit": "3832210580d516365ddae1a62071001faf94d416",
            "patch": "--- a/astropy/wcs/wcsapi/fitswcs.py\n+++ b/astropy/wcs/wcsapi/fitswcs.py\n",
            "FAIL_TO_PASS": ["astropy/wcs/wcsapi/tests/test_fitswcs.py::test_non_convergence_warning"],
            "PASS_TO_PASS": ["astropy/wcs/wcsapi/tests/test_fitswcs.py::test_empty"]
        })
    }

    fn write_data_point(value: &serde_json::Value) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dp.json");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(value.to_string().as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_data_point_valid() {
        let (_dir, path) = write_data_point(&sample_json());
        let record = load_data_point(&path).unwrap();
        assert_eq!(record.instance_id, "astropy__astropy-11693");
        assert_eq!(record.fail_to_pass.len(), 1);
        assert_eq!(record.pass_to_pass.len(), 1);
        assert!(record.env_manifest.is_none());
    }

    #[test]
    fn test_load_data_point_missing_fields_named() {
        let mut value = sample_json();
        value.as_object_mut().unwrap().remove("patch");
        value.as_object_mut().unwrap().remove("FAIL_TO_PASS");
        let (_dir, path) = write_data_point(&value);

        let err = load_data_point(&path).unwrap_err();
        assert_eq!(err.kind(), "SchemaError");
        let msg = err.to_string();
        assert!(msg.contains("patch"));
        assert!(msg.contains("FAIL_TO_PASS"));
    }

    #[test]
    fn test_load_data_point_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();

        let err = load_data_point(&path).unwrap_err();
        assert_eq!(err.kind(), "SchemaError");
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn test_test_list_accepts_json_string_encoding() {
        let mut value = sample_json();
        value["FAIL_TO_PASS"] = serde_json::json!("[\"tests/test_a.py::t1\", \"tests/test_b.py::t2\"]");
        let (_dir, path) = write_data_point(&value);

        let record = load_data_point(&path).unwrap();
        assert_eq!(
            record.fail_to_pass,
            vec!["tests/test_a.py::t1", "tests/test_b.py::t2"]
        );
    }

    #[test]
    fn test_test_list_accepts_comma_separated() {
        assert_eq!(
            parse_test_list("tests/a.py::t1, tests/b.py::t2 ,"),
            vec!["tests/a.py::t1", "tests/b.py::t2"]
        );
        assert!(parse_test_list("  ").is_empty());
    }

    #[test]
    fn test_repo_family_from_instance_id() {
        let record: InstanceRecord = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(record.repo_family(), "astropy");
    }

    #[test]
    fn test_dataset_load_and_lookup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "{}", sample_json()).unwrap();
        writeln!(file).unwrap();

        let dataset = Dataset::load(&path).unwrap();
        assert_eq!(dataset.len(), 1);
        assert!(dataset.contains("astropy__astropy-11693"));
        assert!(!dataset.contains("django__django-11099"));
        assert_eq!(
            dataset.get("astropy__astropy-11693").unwrap().repo,
            "astropy/astropy"
        );
    }

    #[test]
    fn test_dataset_rejects_malformed_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");
        fs::write(&path, "{\"instance_id\": \"only-an-id\"}\n").unwrap();

        let err = Dataset::load(&path).unwrap_err();
        assert_eq!(err.kind(), "SchemaError");
    }
}

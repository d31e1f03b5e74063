//! Patch application inside the instance container.

use std::time::Duration;

use benchgate_core::ValidationError;
use tracing::{debug, info};

use crate::runtime::ContainerSession;

/// Where the instance layer stages the candidate patch.
pub const PATCH_PATH: &str = "/tmp/patch.diff";

/// Applying a diff is fast and local; it gets its own small budget
/// independent of the test-phase timeout.
const APPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Applies the staged patch against the checked-out base commit.
pub struct PatchApplicator;

impl PatchApplicator {
    /// Command that applies the staged patch in the container workdir.
    pub fn apply_command() -> Vec<String> {
        vec![
            "git".to_string(),
            "apply".to_string(),
            "--verbose".to_string(),
            PATCH_PATH.to_string(),
        ]
    }

    /// Apply the patch inside `session`. Success requires a clean,
    /// non-conflicting apply; anything else yields `ApplyError` carrying
    /// the raw apply-tool output.
    pub async fn apply(session: &dyn ContainerSession) -> Result<(), ValidationError> {
        debug!("Applying patch from {PATCH_PATH}");

        let output = session
            .exec(&Self::apply_command(), APPLY_TIMEOUT)
            .await
            .map_err(|e| ValidationError::Apply(format!("apply tool did not run: {e}")))?;

        if !output.success() {
            return Err(ValidationError::Apply(output.combined().trim().to_string()));
        }

        info!("Patch applied cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeSession, ScriptedRuntime};
    use std::sync::Arc;

    fn session_for(runtime: &Arc<ScriptedRuntime>, instance_id: &str) -> FakeSession {
        FakeSession::for_instance(runtime, instance_id)
    }

    #[tokio::test]
    async fn test_clean_apply_succeeds() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let session = session_for(&runtime, "astropy__astropy-11693");

        PatchApplicator::apply(&session).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflicting_apply_yields_apply_error_with_tool_output() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script_apply_failure(
            "astropy__astropy-11693",
            "error: patch failed: astropy/wcs/wcsapi/fitswcs.py:324\nerror: astropy/wcs/wcsapi/fitswcs.py: patch does not apply",
        );
        let session = session_for(&runtime, "astropy__astropy-11693");

        let err = PatchApplicator::apply(&session).await.unwrap_err();
        assert_eq!(err.kind(), "ApplyError");
        assert!(err.to_string().contains("patch does not apply"));
    }

    #[test]
    fn test_apply_command_targets_staged_patch() {
        let command = PatchApplicator::apply_command();
        assert_eq!(command[0], "git");
        assert!(command.contains(&PATCH_PATH.to_string()));
    }
}

//! Per-artifact content verification.
//!
//! Verification calls an external tool that inspects one artifact and
//! deletes it when it carries no meaningful content. Whether the artifact
//! survived is determined by checking for its existence afterwards, not by
//! the exit code. The job must never hang on a verification problem, so
//! every outcome -- success, tool error, timeout -- reports the artifact as
//! processed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Grace period before probing a freshly discovered file, so a renderer
/// still closing its handles is not raced.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Result reported back to the watcher loop. `processed` is implied:
/// verification never leaves an artifact unaccounted for.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub key: String,
    /// False when the tool removed the artifact as void of content.
    pub retained: bool,
}

pub fn build_verify_command(verify_cmd: &Path, artifact: &Path, format: &str) -> Command {
    let mut cmd = Command::new(verify_cmd);
    cmd.arg(artifact)
        .arg(format)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

/// Run the content check for one artifact.
pub async fn verify_artifact(
    verify_cmd: &Path,
    key: String,
    artifact: PathBuf,
    format: &str,
    timeout: Duration,
) -> VerifyOutcome {
    tokio::time::sleep(SETTLE_DELAY).await;

    let mut cmd = build_verify_command(verify_cmd, &artifact, format);
    match cmd.spawn() {
        Ok(mut child) => match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(artifact = %artifact.display(), code = ?status.code(), "Verification exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(artifact = %artifact.display(), error = %e, "Failed to wait on verification");
            }
            Err(_) => {
                tracing::warn!(
                    artifact = %artifact.display(),
                    timeout_secs = timeout.as_secs(),
                    "Verification timed out, killing the check"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(artifact = %artifact.display(), error = %e, "Failed to kill verification");
                }
            }
        },
        Err(e) => {
            tracing::warn!(artifact = %artifact.display(), error = %e, "Failed to spawn verification");
        }
    }

    let retained = artifact.exists();
    if retained {
        tracing::info!(artifact = %artifact.display(), "Verification finished, content detected");
    } else {
        tracing::info!(artifact = %artifact.display(), "Verification finished, empty artifact removed");
    }

    VerifyOutcome { key, retained }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use super::*;

    #[test]
    fn verify_command_arguments() {
        let cmd = build_verify_command(
            Path::new("layersmith-verify"),
            Path::new("/out/layer_01.sgi"),
            "sgi",
        );
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(OsStr::to_string_lossy)
            .collect();
        assert_eq!(args, ["/out/layer_01.sgi", "sgi"]);
    }
}

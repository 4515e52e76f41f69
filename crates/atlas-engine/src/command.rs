//! Shell command execution for the validation pipeline and detectors.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use atlas_core::CommandOutput;

use crate::interfaces::{CommandRunner, RunnerError};

/// Runs commands through `sh -c` in the given working directory.
///
/// Stateless, so a single instance can be shared by the concurrent lint and
/// test sub-tasks of the validation pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        work_dir: &Path,
        command: &str,
    ) -> Result<CommandOutput, RunnerError> {
        if cancel.is_cancelled() {
            return Err(RunnerError::Canceled);
        }

        debug!(command, work_dir = %work_dir.display(), "executing command");
        let start = Utc::now();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Take the handles before waiting so output survives a kill.
        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        let exit_code = tokio::select! {
            status = child.wait() => status?.code().unwrap_or(-1),
            () = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(command, error = %e, "failed to kill canceled process");
                }
                let _ = child.wait().await;
                return Err(RunnerError::Canceled);
            }
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(ref mut handle) = stdout_handle {
            let _ = handle.read_to_end(&mut stdout).await;
        }
        if let Some(ref mut handle) = stderr_handle {
            let _ = handle.read_to_end(&mut stderr).await;
        }

        let duration_ms = (Utc::now() - start).num_milliseconds().max(0) as u64;
        let success = exit_code == 0;

        if success {
            debug!(command, duration_ms, "command passed");
        } else {
            warn!(command, exit_code, duration_ms, "command failed");
        }

        Ok(CommandOutput {
            command: command.to_string(),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
            success,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn runs_successful_command() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let output = ShellRunner
            .run(&cancel, dir.path(), "echo hello")
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn captures_failure_and_stderr() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let output = ShellRunner
            .run(&cancel, dir.path(), "echo oops >&2; exit 3")
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn respects_working_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let cancel = CancellationToken::new();
        let output = ShellRunner
            .run(&cancel, dir.path(), "cat marker.txt")
            .await
            .unwrap();
        assert_eq!(output.stdout, "here");
    }

    #[tokio::test]
    async fn refuses_when_already_canceled() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ShellRunner.run(&cancel, dir.path(), "echo hello").await;
        assert!(matches!(result, Err(RunnerError::Canceled)));
    }

    #[tokio::test]
    async fn kills_process_on_cancel() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let start = std::time::Instant::now();
        let result = ShellRunner.run(&cancel, dir.path(), "sleep 30").await;
        assert!(matches!(result, Err(RunnerError::Canceled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

//! Collaborator interfaces consumed by the step executors.
//!
//! One canonical trait per external concern, injected everywhere it is
//! needed; there is no adapter layer between packages. Implementations live
//! either in this crate (shell runner, filesystem stores) or outside the
//! engine entirely (AI backend, git/PR hub, notifier).

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use atlas_core::{AIRequest, AIResult, CIWatchOptions, CIWatchResult, CommandOutput};

/// Errors from external runner calls (shell, AI, hub, tool probes).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("operation canceled")]
    Canceled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invocation timed out after {0} seconds")]
    Timeout(u64),
    #[error("{0}")]
    Other(String),
}

impl RunnerError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Errors from persistence collaborators (artifacts, loop state).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Runs a shell command in a working directory.
///
/// Implementations shared by the parallel validation pipeline must be
/// thread-safe; the bundled [`crate::command::ShellRunner`] is stateless.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        work_dir: &Path,
        command: &str,
    ) -> Result<CommandOutput, RunnerError>;
}

/// Opaque AI backend: takes a request, returns text plus files changed.
#[async_trait]
pub trait AIRunner: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        request: AIRequest,
    ) -> Result<AIResult, RunnerError>;
}

/// Opaque git/PR hub backend.
///
/// Only `watch_pr_checks` is exercised by the CI step; the remaining PR
/// operations share the interface for the surrounding tooling.
#[async_trait]
pub trait HubRunner: Send + Sync {
    async fn watch_pr_checks(
        &self,
        cancel: &CancellationToken,
        options: &CIWatchOptions,
    ) -> Result<CIWatchResult, RunnerError>;

    async fn create_pr(
        &self,
        cancel: &CancellationToken,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<i64, RunnerError>;

    async fn get_pr_status(
        &self,
        cancel: &CancellationToken,
        pr_number: i64,
    ) -> Result<String, RunnerError>;

    async fn merge_pr(&self, cancel: &CancellationToken, pr_number: i64)
        -> Result<(), RunnerError>;

    async fn convert_to_draft(
        &self,
        cancel: &CancellationToken,
        pr_number: i64,
    ) -> Result<(), RunnerError>;

    async fn add_pr_review(
        &self,
        cancel: &CancellationToken,
        pr_number: i64,
        body: &str,
    ) -> Result<(), RunnerError>;

    async fn add_pr_comment(
        &self,
        cancel: &CancellationToken,
        pr_number: i64,
        body: &str,
    ) -> Result<(), RunnerError>;
}

/// Persists artifact bytes under `(workspace, task, name)`.
///
/// The versioned variant must pick the next free version atomically so two
/// concurrent saves with the same base name get distinct names.
#[async_trait]
pub trait ArtifactSaver: Send + Sync {
    /// Save under the exact name; returns the stored key.
    async fn save_artifact(
        &self,
        workspace: &str,
        task: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError>;

    /// Save under an auto-versioned name derived from `base_name`; returns
    /// the actual key chosen (`validation.json`, `validation.1.json`, ...).
    async fn save_versioned_artifact(
        &self,
        workspace: &str,
        task: &str,
        base_name: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError>;
}

/// Probe for an external CLI tool.
#[derive(Debug, Clone, Default)]
pub struct ToolStatus {
    pub installed: bool,
    pub version: Option<String>,
}

#[async_trait]
pub trait ToolChecker: Send + Sync {
    async fn is_tool_installed(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ToolStatus, RunnerError>;
}

/// Terminal notifier. Failures are silent by contract.
pub trait Notifier: Send + Sync {
    fn bell(&self);
}

/// Durable checkpoint store for loop state, keyed by (task, step name).
#[async_trait]
pub trait LoopStateStore: Send + Sync {
    async fn save_loop_state(
        &self,
        task: &atlas_core::Task,
        state: &atlas_core::LoopState,
    ) -> Result<(), StoreError>;

    /// `Ok(None)` when no checkpoint exists.
    async fn load_loop_state(
        &self,
        task: &atlas_core::Task,
        step_name: &str,
    ) -> Result<Option<atlas_core::LoopState>, StoreError>;
}

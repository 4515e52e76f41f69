//! CI watch step: poll external PR checks and dispatch on the terminal state.
//!
//! Success is the only state that lets the task continue on its own. A
//! failure either fails the step or, when a human-approval handler is
//! wired in, hands off and pauses. Timeouts and fetch errors always pause
//! rather than guessing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use atlas_core::config::{coerce_i64, opt_duration, opt_string_list};
use atlas_core::{
    CIStatus, CIWatchOptions, CIWatchResult, CheckBucket, StepDefinition, StepResult, StepStatus,
    StepType, Task, META_FAILURE_TYPE, META_PR_NUMBER, META_SKIP_GIT_STEPS,
};

use crate::executor::{run_bounded, ExecutionResult, StepError, StepExecutor};
use crate::interfaces::{ArtifactSaver, HubRunner, RunnerError};

/// Polling cadence when the step config does not set one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Marker recorded when the watcher could not fetch check state.
pub const FAILURE_TYPE_FETCH_ERROR: &str = "ci_fetch_error";

/// Optional human-approval handoff invoked on CI failure.
#[async_trait]
pub trait CIFailureHandler: Send + Sync {
    async fn on_failure(&self, task: &Task, watch: &CIWatchResult);
}

/// Executes `ci` steps.
pub struct CIExecutor {
    hub: Arc<dyn HubRunner>,
    artifacts: Arc<dyn ArtifactSaver>,
    failure_handler: Option<Arc<dyn CIFailureHandler>>,
}

impl CIExecutor {
    pub fn new(hub: Arc<dyn HubRunner>, artifacts: Arc<dyn ArtifactSaver>) -> Self {
        Self {
            hub,
            artifacts,
            failure_handler: None,
        }
    }

    /// Route CI failures to a human instead of failing the step.
    pub fn with_failure_handler(mut self, handler: Arc<dyn CIFailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    /// Read and validate the PR number from task metadata. Accepts integer
    /// and floating-point encodings; non-positive values are config errors.
    fn pr_number(task: &Task) -> Result<i64, String> {
        let value = task
            .metadata
            .get(META_PR_NUMBER)
            .ok_or_else(|| format!("task metadata is missing {META_PR_NUMBER}"))?;
        let number =
            coerce_i64(value).ok_or_else(|| format!("{META_PR_NUMBER} is not a number: {value}"))?;
        if number <= 0 {
            return Err(format!("{META_PR_NUMBER} must be positive, got {number}"));
        }
        Ok(number)
    }

    fn watch_options(task: &Task, step: &StepDefinition) -> Result<CIWatchOptions, String> {
        let pr_number = Self::pr_number(task)?;
        let poll_interval = opt_duration(&step.config, "poll_interval")
            .map_err(|e| e.to_string())?
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let timeout = opt_duration(&step.config, "timeout").map_err(|e| e.to_string())?;
        let workflows = opt_string_list(&step.config, "workflows");
        Ok(CIWatchOptions {
            pr_number,
            poll_interval,
            timeout,
            workflows,
        })
    }

    /// Failed and canceled checks only, one line each with its URL.
    fn format_failed_checks(watch: &CIWatchResult) -> String {
        let mut output = String::from("CI checks did not pass:\n");
        for check in watch
            .check_results
            .iter()
            .filter(|c| matches!(c.bucket, CheckBucket::Fail | CheckBucket::Cancel))
        {
            output.push_str(&format!(
                "- {} ({})\n",
                check.name,
                check.url.as_deref().unwrap_or("no url")
            ));
        }
        output
    }

    async fn save_result_artifact(
        &self,
        task: &Task,
        step: &StepDefinition,
        watch: &CIWatchResult,
    ) -> Option<String> {
        let failed: Vec<_> = watch
            .check_results
            .iter()
            .filter(|c| matches!(c.bucket, CheckBucket::Fail | CheckBucket::Cancel))
            .collect();
        let document = json!({
            "status": watch.status.as_str(),
            "elapsed_ms": watch.elapsed_ms,
            "failed_checks": failed,
            "error": watch.error,
        });
        let bytes = match serde_json::to_vec_pretty(&document) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize CI result");
                return None;
            }
        };

        let name = format!("{}/ci-result.json", step.name);
        match self
            .artifacts
            .save_artifact(&task.workspace_id, task.id.as_ref(), &name, &bytes)
            .await
        {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "failed to save CI result artifact");
                None
            }
        }
    }
}

#[async_trait]
impl StepExecutor for CIExecutor {
    fn step_type(&self) -> StepType {
        StepType::Ci
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        task: &mut Task,
        step: &StepDefinition,
    ) -> ExecutionResult {
        if cancel.is_cancelled() {
            return Err(StepError::Canceled);
        }

        let mut result = StepResult::begin(task.current_step, &step.name);

        // A prior commit step that found nothing to commit means there is no
        // PR state to watch.
        if task.metadata_bool(META_SKIP_GIT_STEPS) {
            result.output =
                "skipping CI watch: a prior commit step found nothing to commit".to_string();
            return Ok(result.finish(StepStatus::Skipped));
        }

        let options = match Self::watch_options(task, step) {
            Ok(options) => options,
            Err(reason) => return Err(StepError::fail(result, reason)),
        };

        info!(
            step = step.name.as_str(),
            pr_number = options.pr_number,
            poll_interval_secs = options.poll_interval.as_secs(),
            workflows = options.workflows.len(),
            "watching PR checks"
        );

        let child = cancel.child_token();
        let outcome = run_bounded(step.timeout, self.hub.watch_pr_checks(&child, &options)).await;
        if matches!(outcome, Err(RunnerError::Timeout(_))) {
            child.cancel();
        }

        let watch = match outcome {
            Ok(watch) => watch,
            Err(RunnerError::Canceled) => return Err(StepError::Canceled),
            Err(e) => return Err(StepError::fail(result, format!("CI watch failed: {e}"))),
        };

        result.artifact_path = self.save_result_artifact(task, step, &watch).await;

        match watch.status {
            CIStatus::Success => {
                result.output = format!(
                    "all CI checks passed after {}ms",
                    watch.elapsed_ms
                );
                Ok(result.finish(StepStatus::Success))
            }
            CIStatus::Failure => {
                result.output = Self::format_failed_checks(&watch);
                if let Some(handler) = &self.failure_handler {
                    handler.on_failure(task, &watch).await;
                    Ok(result.finish(StepStatus::AwaitingApproval))
                } else {
                    Err(StepError::fail(result, "CI checks failed"))
                }
            }
            CIStatus::Timeout => {
                result.output = format!(
                    "CI watch timed out after {}ms; waiting for a human decision",
                    watch.elapsed_ms
                );
                Ok(result.finish(StepStatus::AwaitingApproval))
            }
            CIStatus::FetchError => {
                result.set_metadata(META_FAILURE_TYPE, json!(FAILURE_TYPE_FETCH_ERROR));
                result.output = format!(
                    "could not fetch CI check state: {}",
                    watch.error.as_deref().unwrap_or("unknown error")
                );
                Ok(result.finish(StepStatus::AwaitingApproval))
            }
        }
    }
}

//! Step executor contract, error taxonomy, and dispatch registry.
//!
//! Every executor is matched to exactly one step type. Failures travel with
//! the populated `StepResult` so the driver can record artifacts, timings,
//! and output even for failed steps; cancellation travels bare and is never
//! masked.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use atlas_core::{StepDefinition, StepResult, StepStatus, StepType, Task};

use crate::interfaces::RunnerError;

#[derive(Debug, Error)]
pub enum StepError {
    /// Cancellation or deadline from the driver; no result is produced.
    #[error("step canceled")]
    Canceled,
    /// The step failed. Carries the populated failed result.
    #[error("step failed: {reason}")]
    Failed {
        result: Box<StepResult>,
        reason: String,
    },
}

impl StepError {
    /// Build a failure from an in-flight result, stamping status and error.
    pub fn fail(result: StepResult, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut result = result.finish(StepStatus::Failed);
        result.error = Some(reason.clone());
        Self::Failed {
            result: Box::new(result),
            reason,
        }
    }

    /// The failed result, when one was produced.
    pub fn step_result(&self) -> Option<&StepResult> {
        match self {
            Self::Canceled => None,
            Self::Failed { result, .. } => Some(result),
        }
    }
}

pub type ExecutionResult = std::result::Result<StepResult, StepError>;

/// One step type's execution engine.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Step type this executor handles; dispatch is exact-match.
    fn step_type(&self) -> StepType;

    /// Execute the step against the task.
    ///
    /// Contract: poll `cancel` before starting external work; bound the
    /// external call by `step.timeout` when set; stamp timing on every
    /// non-canceled return path; on failure return the populated result
    /// inside [`StepError::Failed`].
    async fn execute(
        &self,
        cancel: &CancellationToken,
        task: &mut Task,
        step: &StepDefinition,
    ) -> ExecutionResult;

    /// Whether the driver may retry this executor at all.
    fn retry_enabled(&self) -> bool {
        false
    }

    /// Upper bound on retry attempts. The retry decision is the driver's.
    fn max_retry_attempts(&self) -> u32 {
        0
    }

    fn can_retry(&self, attempt: u32) -> bool {
        self.retry_enabled() && attempt < self.max_retry_attempts()
    }
}

/// Narrow interface the loop executor uses to run inner steps.
///
/// Implemented by the driver; this breaks the recursion between the loop
/// executor and the step dispatch that contains it.
#[async_trait]
pub trait InnerStepRunner: Send + Sync {
    async fn execute_step(
        &self,
        cancel: &CancellationToken,
        task: &mut Task,
        step: &StepDefinition,
    ) -> ExecutionResult;
}

/// Bound a runner future by an optional step timeout.
///
/// The timeout guard lives only for this call, so it is released on every
/// exit path. Callers pass a child token into the future and cancel it when
/// `Timeout` comes back, so the in-flight call aborts cooperatively.
pub(crate) async fn run_bounded<T, F>(
    timeout: Option<Duration>,
    fut: F,
) -> std::result::Result<T, RunnerError>
where
    F: Future<Output = std::result::Result<T, RunnerError>>,
{
    match timeout {
        Some(limit) if !limit.is_zero() => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Timeout(limit.as_secs())),
        },
        _ => fut.await,
    }
}

/// Maps step types to executors.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StepType, Arc<dyn StepExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("step_types", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own step type. Last write wins.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(executor.step_type(), executor);
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&step_type).map(Arc::clone)
    }

    /// Dispatch a step to its executor.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        task: &mut Task,
        step: &StepDefinition,
    ) -> ExecutionResult {
        let Some(executor) = self.get(step.step_type) else {
            let result = StepResult::begin(task.current_step, &step.name);
            return Err(StepError::fail(
                result,
                format!("no executor registered for step type '{}'", step.step_type),
            ));
        };
        executor.execute(cancel, task, step).await
    }

    /// A registry where every executor is wrapped to report what it would do
    /// instead of doing it.
    pub fn dry_run(&self) -> Self {
        let mut registry = Self::new();
        for executor in self.executors.values() {
            registry.register(Arc::new(DryRunExecutor::new(Arc::clone(executor))));
        }
        registry
    }
}

/// Wrapper that synthesizes a `would_execute` result without side effects.
pub struct DryRunExecutor {
    inner: Arc<dyn StepExecutor>,
}

impl DryRunExecutor {
    pub fn new(inner: Arc<dyn StepExecutor>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StepExecutor for DryRunExecutor {
    fn step_type(&self) -> StepType {
        self.inner.step_type()
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
        result.output = format!(
            "[dry-run] would execute {} step '{}'",
            step.step_type, step.name
        );
        Ok(result.finish(StepStatus::WouldExecute))
    }
}

//! AI invocation step.
//!
//! Builds the request by layering step overrides onto the task configuration
//! in a fixed order (agent, permission_mode, prompt_template, model,
//! timeout), optionally injects the most recent validation failure into the
//! prompt, runs the backend, and saves a best-effort audit artifact.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use atlas_core::config::{opt_bool, opt_duration, opt_str};
use atlas_core::{
    AIRequest, AIResult, Agent, PipelineResult, StepDefinition, StepResult, StepStatus, StepType,
    Task, META_PIPELINE_RESULT, META_VALIDATION_FAILED,
};

use crate::executor::{run_bounded, ExecutionResult, StepError, StepExecutor};
use crate::interfaces::{AIRunner, ArtifactSaver, RunnerError};
use crate::validation::format_failure_block;

/// Marker line prepended to injected validation errors.
const ERROR_BLOCK_HEADER: &str = "--- Validation Errors to Fix ---";

/// Executes `ai` steps against the configured backend.
pub struct AIExecutor {
    runner: Arc<dyn AIRunner>,
    artifacts: Arc<dyn ArtifactSaver>,
    max_retries: u32,
}

impl AIExecutor {
    pub fn new(runner: Arc<dyn AIRunner>, artifacts: Arc<dyn ArtifactSaver>) -> Self {
        Self {
            runner,
            artifacts,
            max_retries: 0,
        }
    }

    /// Let the driver retry failed AI invocations up to `max_retries` times.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Layer step config over task config in the documented override order.
    ///
    /// Tie-break: switching agents without an explicit `model` swaps in the
    /// new agent's default model; reasserting the same agent preserves the
    /// task model.
    fn build_request(task: &Task, step: &StepDefinition) -> Result<AIRequest, String> {
        let cfg = &task.config;
        let mut agent = cfg.agent;
        let mut model = cfg.model.clone();
        let mut prompt = task.description.clone();
        let mut permission_mode = cfg.permission_mode.clone();
        let mut timeout_secs = cfg.timeout_secs;

        if let Some(name) = opt_str(&step.config, "agent") {
            let new_agent: Agent = name.parse()?;
            if new_agent != agent && opt_str(&step.config, "model").is_none() {
                model = new_agent.default_model().to_string();
            }
            agent = new_agent;
        }
        if let Some(mode) = opt_str(&step.config, "permission_mode") {
            permission_mode = mode.to_string();
        }
        if let Some(template) = opt_str(&step.config, "prompt_template") {
            prompt = format!("{template}: {}", task.description);
        }
        if let Some(explicit) = opt_str(&step.config, "model") {
            model = explicit.to_string();
        }
        if let Some(timeout) = opt_duration(&step.config, "timeout").map_err(|e| e.to_string())? {
            timeout_secs = timeout.as_secs();
        }

        Ok(AIRequest {
            agent,
            prompt,
            model,
            max_turns: cfg.max_turns,
            permission_mode,
            timeout_secs,
            working_dir: task.workspace_root.clone(),
        })
    }

    /// Append the most recent validation failure to the prompt, if any.
    fn inject_previous_errors(task: &Task, prompt: &mut String) {
        let pipeline = task.step_results.iter().rev().find_map(|result| {
            if !result
                .metadata
                .get(META_VALIDATION_FAILED)
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
            {
                return None;
            }
            let value = result.metadata.get(META_PIPELINE_RESULT)?;
            serde_json::from_value::<PipelineResult>(value.clone()).ok()
        });

        if let Some(pipeline) = pipeline {
            prompt.push_str(&format!(
                "\n\n{ERROR_BLOCK_HEADER}\n{}",
                format_failure_block(&pipeline)
            ));
        }
    }

    async fn save_audit(
        &self,
        task: &Task,
        step: &StepDefinition,
        request: &AIRequest,
        response: Option<&AIResult>,
        error: Option<&str>,
        duration_ms: u64,
    ) -> Option<String> {
        #[derive(Serialize)]
        struct Audit<'a> {
            request: &'a AIRequest,
            response: Option<&'a AIResult>,
            duration_ms: u64,
            success: bool,
            error: Option<&'a str>,
            recorded_at: chrono::DateTime<Utc>,
        }

        let audit = Audit {
            request,
            response,
            duration_ms,
            success: error.is_none(),
            error,
            recorded_at: Utc::now(),
        };
        let bytes = match serde_json::to_vec_pretty(&audit) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize AI audit artifact");
                return None;
            }
        };

        let base_name = format!("{}/ai-audit.json", step.name);
        match self
            .artifacts
            .save_versioned_artifact(&task.workspace_id, task.id.as_ref(), &base_name, &bytes)
            .await
        {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "failed to save AI audit artifact");
                None
            }
        }
    }
}

#[async_trait]
impl StepExecutor for AIExecutor {
    fn step_type(&self) -> StepType {
        StepType::Ai
    }

    fn retry_enabled(&self) -> bool {
        self.max_retries > 0
    }

    fn max_retry_attempts(&self) -> u32 {
        self.max_retries
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

        let result = StepResult::begin(task.current_step, &step.name);

        let mut request = match Self::build_request(task, step) {
            Ok(request) => request,
            Err(reason) => return Err(StepError::fail(result, reason)),
        };
        if opt_bool(&step.config, "include_previous_errors") {
            Self::inject_previous_errors(task, &mut request.prompt);
        }

        info!(
            step = step.name.as_str(),
            agent = request.agent.as_str(),
            model = request.model.as_str(),
            "invoking AI backend"
        );

        let child = cancel.child_token();
        let started = std::time::Instant::now();
        let outcome = run_bounded(step.timeout, self.runner.run(&child, request.clone())).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        if matches!(outcome, Err(RunnerError::Timeout(_))) {
            child.cancel();
        }

        match outcome {
            Ok(ai_result) => {
                let artifact_path = self
                    .save_audit(task, step, &request, Some(&ai_result), None, duration_ms)
                    .await;

                let mut result = result;
                result.output = ai_result.output;
                result.session_id = ai_result.session_id;
                result.num_turns = ai_result.num_turns;
                result.files_changed = ai_result.files_changed;
                result.artifact_path = artifact_path;
                Ok(result.finish(StepStatus::Success))
            }
            Err(RunnerError::Canceled) => Err(StepError::Canceled),
            Err(e) => {
                let message = e.to_string();
                let artifact_path = self
                    .save_audit(task, step, &request, None, Some(&message), duration_ms)
                    .await;
                let mut result = result;
                result.artifact_path = artifact_path;
                Err(StepError::fail(result, format!("AI invocation failed: {message}")))
            }
        }
    }
}

//! Loop step: iterate an inner program under multiple termination gates.
//!
//! The executor owns a checkpointed `LoopState` for the duration of the
//! step. Exit precedence at each boundary: cancellation, then max
//! iterations, then the named `until` condition; after an iteration:
//! stagnation breaker, then the dual-gate exit signal, and on the error
//! path the consecutive-error breaker. Cancellation mid-iteration never
//! advances counters; the previous checkpoint is the authoritative resume
//! point.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use atlas_core::{
    evaluate_named_condition, truncate_output, ExitEvaluator, ExitReason, IterationResult,
    IterationSummary, LoopConfig, LoopState, ScratchpadData, StepDefinition, StepResult,
    StepStatus, StepType, Task, META_SCRATCHPAD_SETUP_ERROR, SUMMARY_MAX_CHARS,
};

use crate::executor::{ExecutionResult, InnerStepRunner, StepError, StepExecutor};
use crate::interfaces::LoopStateStore;
use crate::scratchpad::Scratchpad;

/// Consecutive checkpoint failures tolerated before the loop aborts.
const CHECKPOINT_FAILURE_LIMIT: u32 = 3;

/// Metadata keys written by the loop step.
pub const META_EXIT_REASON: &str = "exit_reason";
pub const META_ITERATIONS_COMPLETED: &str = "iterations_completed";

/// Executes `loop` steps by driving inner steps through the driver-provided
/// [`InnerStepRunner`].
pub struct LoopExecutor {
    inner: Arc<dyn InnerStepRunner>,
    state_store: Arc<dyn LoopStateStore>,
    artifacts_root: PathBuf,
}

impl LoopExecutor {
    pub fn new(
        inner: Arc<dyn InnerStepRunner>,
        state_store: Arc<dyn LoopStateStore>,
        artifacts_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner,
            state_store,
            artifacts_root: artifacts_root.into(),
        }
    }

    /// Load the checkpoint, or start fresh. Load failures are demoted to a
    /// fresh start; losing a corrupt checkpoint beats failing the task.
    async fn load_or_fresh(&self, task: &Task, step: &StepDefinition, config: &LoopConfig) -> LoopState {
        match self.state_store.load_loop_state(task, &step.name).await {
            Ok(Some(mut state)) => {
                info!(
                    step = step.name.as_str(),
                    iteration = state.current_iteration,
                    "resuming loop from checkpoint"
                );
                // The current configuration wins over the stored bound. A
                // stored max-iterations verdict is re-derived against the new
                // bound; other stored verdicts stand.
                state.max_iterations = config.max_iterations;
                state.current_inner_step = 0;
                if state.exit_reason == Some(ExitReason::MaxIterationsReached)
                    && (state.max_iterations == 0
                        || state.current_iteration < state.max_iterations)
                {
                    state.exit_reason = None;
                }
                state
            }
            Ok(None) => LoopState::fresh(&step.name, config.max_iterations),
            Err(e) => {
                warn!(step = step.name.as_str(), error = %e, "failed to load loop state; starting fresh");
                LoopState::fresh(&step.name, config.max_iterations)
            }
        }
    }

    /// Set up the scratchpad when configured. Setup failure is recorded in
    /// task metadata and disables the scratchpad; it never fails the step.
    async fn setup_scratchpad(
        &self,
        task: &mut Task,
        step: &StepDefinition,
        config: &LoopConfig,
        state: &mut LoopState,
    ) -> Option<Scratchpad> {
        let file = config.scratchpad_file.as_deref()?;
        let path = self
            .artifacts_root
            .join(&task.workspace_id)
            .join(task.id.as_ref())
            .join(&step.name)
            .join(file);
        let pad = Scratchpad::new(path.clone());
        state.scratchpad_path = Some(path.to_string_lossy().to_string());

        if state.completed_iterations.is_empty() && !pad.exists() {
            let data = ScratchpadData::new(task.id.to_string(), step.name.clone());
            if let Err(e) = pad.write(&data).await {
                warn!(step = step.name.as_str(), error = %e, "scratchpad setup failed");
                task.set_metadata(META_SCRATCHPAD_SETUP_ERROR, json!(e.to_string()));
                return None;
            }
        }
        Some(pad)
    }

    async fn append_scratchpad(pad: Option<&Scratchpad>, iteration: &IterationResult) {
        let Some(pad) = pad else { return };
        let summary = iteration
            .step_results
            .iter()
            .map(|r| format!("{}: {}", r.step_name, truncate_output(&r.output, SUMMARY_MAX_CHARS)))
            .collect::<Vec<_>>()
            .join("\n");
        let entry = IterationSummary {
            number: iteration.iteration,
            completed_at: iteration.completed_at,
            files_changed: iteration.files_changed.clone(),
            summary,
            exit_signal: iteration.exit_signal,
            success: iteration.error.is_none(),
            error: iteration.error.clone(),
        };
        if let Err(e) = pad.append_iteration(entry).await {
            warn!(error = %e, "failed to append scratchpad iteration");
        }
    }

    /// Persist the state, enforcing the three-strike rule. Returns `false`
    /// when the strike limit is reached and the loop must abort.
    async fn checkpoint(&self, task: &Task, state: &mut LoopState) -> bool {
        match self.state_store.save_loop_state(task, state).await {
            Ok(()) => {
                state.consecutive_checkpoint_errors = 0;
                state.last_checkpoint = Some(Utc::now());
                true
            }
            Err(e) => {
                state.consecutive_checkpoint_errors += 1;
                warn!(
                    step = state.step_name.as_str(),
                    strikes = state.consecutive_checkpoint_errors,
                    error = %e,
                    "loop checkpoint failed"
                );
                state.consecutive_checkpoint_errors < CHECKPOINT_FAILURE_LIMIT
            }
        }
    }

    fn finish(
        result: StepResult,
        step: &StepDefinition,
        state: &LoopState,
        reason: ExitReason,
    ) -> ExecutionResult {
        let mut result = result;
        result.output = format!(
            "loop '{}' finished after {} iteration(s): {}",
            step.name,
            state.current_iteration,
            reason.as_str()
        );
        result.files_changed = state.all_files_changed();
        result.set_metadata(META_EXIT_REASON, json!(reason.as_str()));
        result.set_metadata(META_ITERATIONS_COMPLETED, json!(state.current_iteration));
        Ok(result.finish(StepStatus::Success))
    }
}

#[async_trait]
impl StepExecutor for LoopExecutor {
    fn step_type(&self) -> StepType {
        StepType::Loop
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

        let config = match LoopConfig::from_step(step) {
            Ok(config) => config,
            Err(e) => return Err(StepError::fail(result, e.to_string())),
        };

        let mut state = self.load_or_fresh(task, step, &config).await;

        // A checkpoint that already terminated keeps its verdict.
        if let Some(reason) = state.exit_reason {
            return Self::finish(result, step, &state, reason);
        }

        let scratchpad = self.setup_scratchpad(task, step, &config, &mut state).await;
        let evaluator = ExitEvaluator::new(config.exit_conditions.clone());

        loop {
            // Boundary precedence: cancellation, max iterations, `until`.
            if cancel.is_cancelled() {
                state.exit_reason = Some(ExitReason::ContextCanceled);
                return Err(StepError::Canceled);
            }
            if state.max_iterations > 0 && state.current_iteration >= state.max_iterations {
                state.exit_reason = Some(ExitReason::MaxIterationsReached);
                let _ = self.checkpoint(task, &mut state).await;
                return Self::finish(result, step, &state, ExitReason::MaxIterationsReached);
            }
            if let Some(name) = &config.until {
                if evaluate_named_condition(name, task) {
                    state.exit_reason = Some(ExitReason::ConditionMet);
                    let _ = self.checkpoint(task, &mut state).await;
                    return Self::finish(result, step, &state, ExitReason::ConditionMet);
                }
            }

            // IterationStart
            let iteration_number = state.current_iteration + 1;
            state.current_inner_step = 0;
            let iter_started = Utc::now();
            let mut step_results: Vec<StepResult> = Vec::new();
            let mut files_changed: Vec<String> = Vec::new();
            let mut combined_output = String::new();
            let mut iteration_error: Option<String> = None;

            // InnerStepExec: definition order, stop on first inner failure.
            for (index, inner_step) in config.steps.iter().enumerate() {
                if cancel.is_cancelled() {
                    // Mid-iteration cancel: counters untouched, previous
                    // checkpoint stays authoritative.
                    state.exit_reason = Some(ExitReason::ContextCanceled);
                    return Err(StepError::Canceled);
                }
                state.current_inner_step = index;

                match self.inner.execute_step(cancel, task, inner_step).await {
                    Ok(inner_result) => {
                        files_changed.extend(inner_result.files_changed.iter().cloned());
                        if !combined_output.is_empty() {
                            combined_output.push('\n');
                        }
                        combined_output.push_str(&inner_result.output);
                        step_results.push(inner_result);
                    }
                    Err(StepError::Canceled) => {
                        state.exit_reason = Some(ExitReason::ContextCanceled);
                        return Err(StepError::Canceled);
                    }
                    Err(StepError::Failed { result: failed, reason }) => {
                        files_changed.extend(failed.files_changed.iter().cloned());
                        step_results.push(*failed);
                        iteration_error = Some(reason);
                        break;
                    }
                }
            }

            // PostIteration
            if let Some(error) = iteration_error {
                state.consecutive_errors += 1;
                warn!(
                    step = step.name.as_str(),
                    iteration = iteration_number,
                    consecutive_errors = state.consecutive_errors,
                    error = error.as_str(),
                    "loop iteration failed"
                );

                // Breaker is checked on the error path before checkpointing.
                let tripped = state.consecutive_errors >= config.consecutive_errors;
                if tripped {
                    state.exit_reason = Some(ExitReason::CircuitBreakerErrors);
                }
                if !self.checkpoint(task, &mut state).await {
                    state.exit_reason = Some(ExitReason::CheckpointFailure);
                    return Err(StepError::fail(
                        result,
                        "loop checkpointing failed three times in a row; aborting to avoid state loss",
                    ));
                }
                if tripped {
                    return Self::finish(result, step, &state, ExitReason::CircuitBreakerErrors);
                }
                continue;
            }

            state.consecutive_errors = 0;
            let decision = if config.until_signal {
                evaluator.evaluate(&combined_output)
            } else {
                evaluator.evaluate("")
            };

            state.current_iteration = iteration_number;
            if files_changed.is_empty() {
                state.stagnation_count += 1;
            } else {
                state.stagnation_count = 0;
            }

            let completed_at = Utc::now();
            let iteration = IterationResult {
                iteration: iteration_number,
                step_results,
                files_changed,
                exit_signal: decision.should_exit,
                error: None,
                started_at: iter_started,
                completed_at,
                duration_ms: (completed_at - iter_started).num_milliseconds().max(0) as u64,
            };
            Self::append_scratchpad(scratchpad.as_ref(), &iteration).await;
            state.completed_iterations.push(iteration);

            info!(
                step = step.name.as_str(),
                iteration = iteration_number,
                exit_signal = decision.should_exit,
                stagnation = state.stagnation_count,
                "loop iteration completed"
            );

            // Post-iteration precedence: stagnation breaker, then signal.
            let exit = if config.stagnation_iterations > 0
                && state.stagnation_count >= config.stagnation_iterations
            {
                Some(ExitReason::CircuitBreakerStagnation)
            } else if decision.should_exit {
                Some(ExitReason::ExitSignal)
            } else {
                None
            };
            state.exit_reason = exit;

            if !self.checkpoint(task, &mut state).await {
                state.exit_reason = Some(ExitReason::CheckpointFailure);
                return Err(StepError::fail(
                    result,
                    "loop checkpointing failed three times in a row; aborting to avoid state loss",
                ));
            }

            if let Some(reason) = exit {
                return Self::finish(result, step, &state, reason);
            }
        }
    }
}

//! Checkpointed loop state and cross-iteration memory documents.
//!
//! `LoopState` is persisted after every completed iteration and after every
//! failed-and-counted iteration, never mid-inner-step. Serialization must be
//! lossless: the checkpoint is the authoritative resume point after a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::StepResult;

/// Why a loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    MaxIterationsReached,
    ExitSignal,
    ConditionMet,
    CircuitBreakerErrors,
    CircuitBreakerStagnation,
    ContextCanceled,
    CheckpointFailure,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxIterationsReached => "max_iterations_reached",
            Self::ExitSignal => "exit_signal",
            Self::ConditionMet => "condition_met",
            Self::CircuitBreakerErrors => "circuit_breaker_errors",
            Self::CircuitBreakerStagnation => "circuit_breaker_stagnation",
            Self::ContextCanceled => "context_canceled",
            Self::CheckpointFailure => "checkpoint_failure",
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    /// 1-indexed iteration number.
    pub iteration: u32,
    pub step_results: Vec<StepResult>,
    /// Raw accumulation across inner steps; duplicates are preserved.
    pub files_changed: Vec<String>,
    pub exit_signal: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Durable loop execution state, keyed by (task, step name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    pub step_name: String,
    /// Number of iterations completed so far.
    pub current_iteration: u32,
    pub max_iterations: u32,
    /// Index of the inner step in flight; reset to 0 at iteration start.
    pub current_inner_step: usize,
    pub completed_iterations: Vec<IterationResult>,
    pub consecutive_errors: u32,
    pub stagnation_count: u32,
    pub consecutive_checkpoint_errors: u32,
    /// Empty until the loop terminates.
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub scratchpad_path: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub last_checkpoint: Option<DateTime<Utc>>,
}

impl LoopState {
    pub fn fresh(step_name: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            step_name: step_name.into(),
            current_iteration: 0,
            max_iterations,
            current_inner_step: 0,
            completed_iterations: Vec::new(),
            consecutive_errors: 0,
            stagnation_count: 0,
            consecutive_checkpoint_errors: 0,
            exit_reason: None,
            scratchpad_path: None,
            started_at: Utc::now(),
            last_checkpoint: None,
        }
    }

    /// Raw files-changed accumulation across all completed iterations.
    pub fn all_files_changed(&self) -> Vec<String> {
        self.completed_iterations
            .iter()
            .flat_map(|iter| iter.files_changed.iter().cloned())
            .collect()
    }
}

// --- Scratchpad document ---

/// Per-iteration entry appended to the scratchpad.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub number: u32,
    pub completed_at: DateTime<Utc>,
    pub files_changed: Vec<String>,
    /// Inner-step outputs, each truncated to [`SUMMARY_MAX_CHARS`].
    pub summary: String,
    pub exit_signal: bool,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Cross-iteration memory document written into the task artifact space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchpadData {
    pub task_id: String,
    pub loop_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub iterations: Vec<IterationSummary>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl ScratchpadData {
    pub fn new(task_id: impl Into<String>, loop_name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            loop_name: loop_name.into(),
            started_at: Utc::now(),
            iterations: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Per-step output cap inside scratchpad summaries.
pub const SUMMARY_MAX_CHARS: usize = 500;

/// Truncate on a character boundary, appending an ellipsis marker when cut.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    let mut truncated: String = output.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

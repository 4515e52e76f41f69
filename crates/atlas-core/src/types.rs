//! Core types for the task step engine.
//!
//! A task moves through an ordered list of step definitions; each execution
//! produces an immutable `StepResult` appended by the driver. Executors
//! communicate across steps through the task metadata bag, using the
//! well-known keys defined at the bottom of this module.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for tasks.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Step type, used for exact-match executor dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Ai,
    Validation,
    Ci,
    Sdd,
    Verify,
    Loop,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Validation => "validation",
            Self::Ci => "ci",
            Self::Sdd => "sdd",
            Self::Verify => "verify",
            Self::Loop => "loop",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
    AwaitingApproval,
    WouldExecute,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::AwaitingApproval => "awaiting_approval",
            Self::WouldExecute => "would_execute",
        }
    }
}

/// AI agent backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    #[default]
    Claude,
    Gemini,
    Codex,
}

impl Agent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Codex => "codex",
        }
    }

    /// Model used when a step overrides the agent without naming a model.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Claude => "sonnet",
            Self::Gemini => "gemini-2.5-pro",
            Self::Codex => "gpt-5-codex",
        }
    }
}

impl std::str::FromStr for Agent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            "codex" => Ok(Self::Codex),
            other => Err(format!("unknown agent: {other}")),
        }
    }
}

// --- Core types ---

/// Immutable per-task configuration supplied by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub agent: Agent,
    pub model: String,
    pub max_turns: u32,
    /// Default timeout for AI invocations, in seconds (0 = none).
    pub timeout_secs: u64,
    pub permission_mode: String,
    /// Legacy fallback commands for the validation test category when the
    /// project defines none.
    pub validation_commands: Vec<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            agent: Agent::Claude,
            model: "sonnet".to_string(),
            max_turns: 50,
            timeout_secs: 600,
            permission_mode: "default".to_string(),
            validation_commands: Vec::new(),
        }
    }
}

/// A unit of work progressing through ordered steps.
///
/// Owned by the driver; executors borrow it, append to nothing, and write
/// metadata only under their own keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    /// Logical namespace for artifacts.
    pub workspace_id: String,
    /// Concrete directory runners execute in.
    pub workspace_root: PathBuf,
    pub description: String,
    pub current_step: usize,
    pub config: TaskConfig,
    pub step_results: Vec<StepResult>,
    pub metadata: serde_json::Map<String, Value>,
}

impl Task {
    pub fn new(workspace_id: impl Into<String>, workspace_root: impl Into<PathBuf>, description: impl Into<String>) -> Self {
        Self {
            id: Id::new(),
            workspace_id: workspace_id.into(),
            workspace_root: workspace_root.into(),
            description: description.into(),
            current_step: 0,
            config: TaskConfig::default(),
            step_results: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Last recorded step result, if any.
    pub fn last_result(&self) -> Option<&StepResult> {
        self.step_results.last()
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn metadata_bool(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// One entry in a template's ordered step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Step-level timeout bounding the external call.
    #[serde(default, with = "crate::config::duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry_count: u32,
    /// Per-type options; recognized keys are enumerated by each executor.
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            name: name.into(),
            step_type,
            description: None,
            required: true,
            timeout: None,
            retry_count: 0,
            config: serde_json::Map::new(),
        }
    }
}

/// Outcome of one step execution. Immutable after the driver appends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub artifact_path: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl StepResult {
    /// Start a result with the clock running. `completed_at` is provisional
    /// until [`StepResult::finish`] stamps it.
    pub fn begin(step_index: usize, step_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_index,
            step_name: step_name.into(),
            status: StepStatus::Failed,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            output: String::new(),
            error: None,
            files_changed: Vec::new(),
            session_id: None,
            num_turns: 0,
            artifact_path: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Stamp the completion time and final status.
    pub fn finish(mut self, status: StepStatus) -> Self {
        self.completed_at = Utc::now();
        self.duration_ms = (self.completed_at - self.started_at).num_milliseconds().max(0) as u64;
        self.status = status;
        self
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }
}

// --- AI runner exchange ---

/// Request handed to the AI backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AIRequest {
    pub agent: Agent,
    pub prompt: String,
    pub model: String,
    pub max_turns: u32,
    pub permission_mode: String,
    /// Invocation timeout in seconds (0 = none).
    pub timeout_secs: u64,
    pub working_dir: PathBuf,
}

/// Response from the AI backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AIResult {
    pub output: String,
    pub session_id: Option<String>,
    pub num_turns: u32,
    pub duration_ms: u64,
    pub files_changed: Vec<String>,
}

// --- CI watcher exchange ---

/// Terminal state reported by the external check watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CIStatus {
    Success,
    Failure,
    Timeout,
    FetchError,
}

impl CIStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::FetchError => "fetch_error",
        }
    }
}

/// Result bucket for a single check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckBucket {
    Pass,
    Fail,
    Pending,
    Cancel,
    Skipped,
}

/// One check run observed on the PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub bucket: CheckBucket,
    #[serde(default)]
    pub url: Option<String>,
}

/// Outcome of watching PR checks until a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CIWatchResult {
    pub status: CIStatus,
    pub elapsed_ms: u64,
    pub check_results: Vec<CheckResult>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Options for the check watcher.
#[derive(Debug, Clone)]
pub struct CIWatchOptions {
    pub pr_number: i64,
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
    /// Workflow names to watch; empty means all.
    pub workflows: Vec<String>,
}

// --- Validation pipeline results ---

/// Captured output of one shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
}

/// Aggregate result of the validation pipeline.
///
/// `success` holds iff no category contains a failed result and no fatal
/// setup error occurred. Skipped categories do not count against it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    #[serde(default)]
    pub failed_step: Option<String>,
    #[serde(default)]
    pub format_results: Vec<CommandOutput>,
    #[serde(default)]
    pub lint_results: Vec<CommandOutput>,
    #[serde(default)]
    pub test_results: Vec<CommandOutput>,
    #[serde(default)]
    pub pre_commit_results: Vec<CommandOutput>,
    #[serde(default)]
    pub skipped_steps: Vec<String>,
    #[serde(default)]
    pub skip_reasons: BTreeMap<String, String>,
    pub duration_ms: u64,
}

impl PipelineResult {
    /// A category passes when it has no failed result (empty counts as pass).
    pub fn category_passed(results: &[CommandOutput]) -> bool {
        results.iter().all(|r| r.success)
    }
}

// --- Template ---

/// Ordered program of steps for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl Template {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

// --- Well-known metadata keys ---

/// PR number consumed by the CI step (int-coercible).
pub const META_PR_NUMBER: &str = "pr_number";
/// Set by a commit step that found nothing to commit; gates CI skip.
pub const META_SKIP_GIT_STEPS: &str = "skip_git_steps";
/// Whether the most recent validation pipeline run failed (detect-only mode).
pub const META_VALIDATION_FAILED: &str = "validation_failed";
/// Marks a validation result produced in detect-only mode.
pub const META_DETECT_ONLY: &str = "detect_only";
/// Full serialized `PipelineResult` for downstream consumers.
pub const META_PIPELINE_RESULT: &str = "pipeline_result";
/// Four-entry per-category check summary.
pub const META_VALIDATION_CHECKS: &str = "validation_checks";
/// Key of the saved artifact for the step.
pub const META_ARTIFACT_PATH: &str = "artifact_path";
/// Failure classification (e.g. `ci_fetch_error`).
pub const META_FAILURE_TYPE: &str = "failure_type";
/// Reason the loop scratchpad could not be initialized.
pub const META_SCRATCHPAD_SETUP_ERROR: &str = "scratchpad_setup_error";

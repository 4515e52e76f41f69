//! Validation pipeline and the step executor that drives it.
//!
//! Execution order: format (sequential) → lint ∥ test (both always complete)
//! → pre-commit (sequential). The pipeline short-circuits only on a format
//! failure, because lint and test would blame missing formatting. Pre-commit
//! is skipped, not failed, when its binary is absent.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use atlas_core::config::opt_bool;
use atlas_core::{
    CommandOutput, PipelineResult, StepDefinition, StepResult, StepStatus, StepType, Task,
    META_ARTIFACT_PATH, META_DETECT_ONLY, META_PIPELINE_RESULT, META_VALIDATION_CHECKS,
    META_VALIDATION_FAILED,
};

use crate::executor::{run_bounded, ExecutionResult, StepError, StepExecutor};
use crate::interfaces::{ArtifactSaver, CommandRunner, Notifier, RunnerError, ToolChecker};

/// Category names in pipeline order.
pub const CATEGORY_FORMAT: &str = "format";
pub const CATEGORY_LINT: &str = "lint";
pub const CATEGORY_TEST: &str = "test";
pub const CATEGORY_PRE_COMMIT: &str = "pre-commit";

/// Lines of command output kept when formatting failures for the AI.
const FAILURE_TAIL_LINES: usize = 120;

/// Project commands per category. Empty categories are no-ops that pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationCommands {
    pub format: Vec<String>,
    pub lint: Vec<String>,
    pub test: Vec<String>,
    pub pre_commit: Vec<String>,
}

impl ValidationCommands {
    /// Apply the legacy task-level fallback: when the project defines no test
    /// commands, `TaskConfig.validation_commands` fills the test category.
    pub fn with_fallback(mut self, legacy: &[String]) -> Self {
        if self.test.is_empty() && !legacy.is_empty() {
            self.test = legacy.to_vec();
        }
        self
    }
}

/// Runs the partially parallel validation pipeline.
pub struct ValidationPipeline {
    runner: Arc<dyn CommandRunner>,
    pre_commit_checker: Arc<dyn ToolChecker>,
    commands: ValidationCommands,
}

impl ValidationPipeline {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        pre_commit_checker: Arc<dyn ToolChecker>,
        commands: ValidationCommands,
    ) -> Self {
        Self {
            runner,
            pre_commit_checker,
            commands,
        }
    }

    /// Run the pipeline. Only cancellation escapes as an error; command
    /// failures (including spawn failures) land in the result.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        work_dir: &Path,
    ) -> Result<PipelineResult, RunnerError> {
        let start = Utc::now();
        let mut result = PipelineResult::default();

        // Phase 1: format, sequential. The only short-circuit in the pipeline.
        result.format_results = self
            .run_category(cancel, work_dir, &self.commands.format)
            .await?;
        if !PipelineResult::category_passed(&result.format_results) {
            result.failed_step = Some(CATEGORY_FORMAT.to_string());
            result.duration_ms = elapsed_ms(start);
            return Ok(result);
        }

        if cancel.is_cancelled() {
            return Err(RunnerError::Canceled);
        }

        // Phase 2: lint and test concurrently; both always run to completion.
        let (lint_results, test_results) = tokio::join!(
            self.run_category(cancel, work_dir, &self.commands.lint),
            self.run_category(cancel, work_dir, &self.commands.test),
        );
        result.lint_results = lint_results?;
        result.test_results = test_results?;

        let lint_passed = PipelineResult::category_passed(&result.lint_results);
        let test_passed = PipelineResult::category_passed(&result.test_results);
        if !lint_passed || !test_passed {
            result.failed_step = Some(
                if lint_passed { CATEGORY_TEST } else { CATEGORY_LINT }.to_string(),
            );
            result.duration_ms = elapsed_ms(start);
            return Ok(result);
        }

        if cancel.is_cancelled() {
            return Err(RunnerError::Canceled);
        }

        // Phase 3: pre-commit, only after everything else passed, and only
        // when the tool exists. Absence is a skip, not a failure.
        match self.pre_commit_gate(cancel).await? {
            Some(skip_reason) => {
                result.skipped_steps.push(CATEGORY_PRE_COMMIT.to_string());
                result
                    .skip_reasons
                    .insert(CATEGORY_PRE_COMMIT.to_string(), skip_reason);
            }
            None => {
                result.pre_commit_results = self
                    .run_category(cancel, work_dir, &self.commands.pre_commit)
                    .await?;
                if !PipelineResult::category_passed(&result.pre_commit_results) {
                    result.failed_step = Some(CATEGORY_PRE_COMMIT.to_string());
                    result.duration_ms = elapsed_ms(start);
                    return Ok(result);
                }
            }
        }

        result.success = true;
        result.duration_ms = elapsed_ms(start);
        Ok(result)
    }

    /// Run every command in a category, collecting all results even after a
    /// failure. Spawn-level errors become synthetic failed outputs so the
    /// pipeline result stays self-describing.
    async fn run_category(
        &self,
        cancel: &CancellationToken,
        work_dir: &Path,
        commands: &[String],
    ) -> Result<Vec<CommandOutput>, RunnerError> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            if cancel.is_cancelled() {
                return Err(RunnerError::Canceled);
            }
            match self.runner.run(cancel, work_dir, command).await {
                Ok(output) => results.push(output),
                Err(RunnerError::Canceled) => return Err(RunnerError::Canceled),
                Err(e) => {
                    warn!(command = command.as_str(), error = %e, "command could not run");
                    results.push(CommandOutput {
                        command: command.clone(),
                        stdout: String::new(),
                        stderr: e.to_string(),
                        exit_code: -1,
                        success: false,
                        duration_ms: 0,
                    });
                }
            }
        }
        Ok(results)
    }

    /// Returns `Some(reason)` when pre-commit must be skipped.
    async fn pre_commit_gate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, RunnerError> {
        if self.commands.pre_commit.is_empty() {
            return Ok(None);
        }
        match self.pre_commit_checker.is_tool_installed(cancel).await {
            Ok(status) if status.installed => Ok(None),
            Ok(_) => Ok(Some("pre-commit is not installed".to_string())),
            Err(RunnerError::Canceled) => Err(RunnerError::Canceled),
            Err(e) => Ok(Some(format!("pre-commit check failed: {e}"))),
        }
    }
}

fn elapsed_ms(start: chrono::DateTime<Utc>) -> u64 {
    (Utc::now() - start).num_milliseconds().max(0) as u64
}

/// Render failed commands as a block the AI can act on.
///
/// Only failing commands appear, each with the tail of its combined output.
pub fn format_failure_block(pipeline: &PipelineResult) -> String {
    let mut block = String::new();
    let categories = [
        (CATEGORY_FORMAT, &pipeline.format_results),
        (CATEGORY_LINT, &pipeline.lint_results),
        (CATEGORY_TEST, &pipeline.test_results),
        (CATEGORY_PRE_COMMIT, &pipeline.pre_commit_results),
    ];

    for (category, results) in categories {
        for output in results.iter().filter(|r| !r.success) {
            block.push_str(&format!(
                "--- FAILED [{category}]: {} (exit {}) ---\n",
                output.command, output.exit_code
            ));
            let combined = if output.stderr.is_empty() {
                output.stdout.clone()
            } else if output.stdout.is_empty() {
                output.stderr.clone()
            } else {
                format!("{}\n\n--- STDERR ---\n{}", output.stdout, output.stderr)
            };
            let lines: Vec<&str> = combined.lines().collect();
            let tail_start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
            for line in &lines[tail_start..] {
                block.push_str(line);
                block.push('\n');
            }
            block.push('\n');
        }
    }
    block
}

/// Executes `validation` steps.
pub struct ValidationExecutor {
    runner: Arc<dyn CommandRunner>,
    pre_commit_checker: Arc<dyn ToolChecker>,
    artifacts: Arc<dyn ArtifactSaver>,
    notifier: Arc<dyn Notifier>,
    commands: ValidationCommands,
}

impl ValidationExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        pre_commit_checker: Arc<dyn ToolChecker>,
        artifacts: Arc<dyn ArtifactSaver>,
        notifier: Arc<dyn Notifier>,
        commands: ValidationCommands,
    ) -> Self {
        Self {
            runner,
            pre_commit_checker,
            artifacts,
            notifier,
            commands,
        }
    }

    /// One entry per category, in pipeline order, on every run.
    fn checks_metadata(pipeline: &PipelineResult) -> serde_json::Value {
        let pre_commit_skipped = pipeline
            .skipped_steps
            .iter()
            .any(|s| s == CATEGORY_PRE_COMMIT);

        let entry = |name: &str, results: &[CommandOutput], skipped: bool| {
            if skipped {
                json!({ "name": name, "passed": true, "skipped": true })
            } else {
                json!({ "name": name, "passed": PipelineResult::category_passed(results) })
            }
        };

        json!([
            entry(CATEGORY_FORMAT, &pipeline.format_results, false),
            entry(CATEGORY_LINT, &pipeline.lint_results, false),
            entry(CATEGORY_TEST, &pipeline.test_results, false),
            entry(
                CATEGORY_PRE_COMMIT,
                &pipeline.pre_commit_results,
                pre_commit_skipped
            ),
        ])
    }

    async fn save_result_artifact(
        &self,
        task: &Task,
        step: &StepDefinition,
        pipeline: &PipelineResult,
    ) -> Option<String> {
        let bytes = match serde_json::to_vec_pretty(pipeline) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize pipeline result");
                return None;
            }
        };
        let base_name = format!("{}/validation.json", step.name);
        match self
            .artifacts
            .save_versioned_artifact(&task.workspace_id, task.id.as_ref(), &base_name, &bytes)
            .await
        {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "failed to save validation artifact");
                None
            }
        }
    }
}

#[async_trait]
impl StepExecutor for ValidationExecutor {
    fn step_type(&self) -> StepType {
        StepType::Validation
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
        let detect_only = opt_bool(&step.config, "detect_only");

        let commands = self
            .commands
            .clone()
            .with_fallback(&task.config.validation_commands);
        let pipeline = ValidationPipeline::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.pre_commit_checker),
            commands,
        );

        let child = cancel.child_token();
        let outcome = run_bounded(step.timeout, pipeline.run(&child, &task.workspace_root)).await;
        if matches!(outcome, Err(RunnerError::Timeout(_))) {
            child.cancel();
        }

        let pipeline_result = match outcome {
            Ok(pipeline_result) => pipeline_result,
            Err(RunnerError::Canceled) => return Err(StepError::Canceled),
            Err(e) => return Err(StepError::fail(result, format!("validation pipeline failed: {e}"))),
        };

        info!(
            step = step.name.as_str(),
            success = pipeline_result.success,
            failed_step = pipeline_result.failed_step.as_deref().unwrap_or(""),
            duration_ms = pipeline_result.duration_ms,
            "validation pipeline finished"
        );

        result.set_metadata(META_VALIDATION_CHECKS, Self::checks_metadata(&pipeline_result));
        match serde_json::to_value(&pipeline_result) {
            Ok(value) => result.set_metadata(META_PIPELINE_RESULT, value),
            Err(e) => warn!(error = %e, "failed to attach pipeline result metadata"),
        }

        if let Some(artifact_path) = self.save_result_artifact(task, step, &pipeline_result).await {
            result.set_metadata(META_ARTIFACT_PATH, json!(artifact_path.clone()));
            result.artifact_path = Some(artifact_path);
        }

        if detect_only {
            result.set_metadata(META_VALIDATION_FAILED, json!(!pipeline_result.success));
            result.set_metadata(META_DETECT_ONLY, json!(true));
        }

        if pipeline_result.success {
            result.output = format!(
                "validation passed in {}ms{}",
                pipeline_result.duration_ms,
                if pipeline_result.skipped_steps.is_empty() {
                    String::new()
                } else {
                    format!(" (skipped: {})", pipeline_result.skipped_steps.join(", "))
                }
            );
            return Ok(result.finish(StepStatus::Success));
        }

        result.output = format_failure_block(&pipeline_result);
        let failed_category = pipeline_result
            .failed_step
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        if detect_only {
            return Ok(result.finish(StepStatus::Success));
        }

        self.notifier.bell();
        Err(StepError::fail(
            result,
            format!("validation failed: {failed_category}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FsArtifactSaver;
    use crate::interfaces::ToolStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted runner: commands containing "fail" exit 1; the call log is
    /// mutex-guarded because lint and test run concurrently.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            cancel: &CancellationToken,
            _work_dir: &Path,
            command: &str,
        ) -> Result<CommandOutput, RunnerError> {
            if cancel.is_cancelled() {
                return Err(RunnerError::Canceled);
            }
            self.calls.lock().unwrap().push(command.to_string());
            let success = !command.contains("fail");
            Ok(CommandOutput {
                command: command.to_string(),
                stdout: String::new(),
                stderr: if success { String::new() } else { format!("{command}: broken") },
                exit_code: i32::from(!success),
                success,
                duration_ms: 1,
            })
        }
    }

    struct StaticChecker {
        installed: bool,
    }

    #[async_trait]
    impl ToolChecker for StaticChecker {
        async fn is_tool_installed(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<ToolStatus, RunnerError> {
            Ok(ToolStatus {
                installed: self.installed,
                version: self.installed.then(|| "3.8.0".to_string()),
            })
        }
    }

    #[derive(Default)]
    struct CountingBell {
        rings: AtomicUsize,
    }

    impl Notifier for CountingBell {
        fn bell(&self) {
            self.rings.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn commands() -> ValidationCommands {
        ValidationCommands {
            format: vec!["fmt".into()],
            lint: vec!["lint".into()],
            test: vec!["test".into()],
            pre_commit: vec!["pre-commit run".into()],
        }
    }

    struct Fixture {
        _dir: TempDir,
        runner: Arc<ScriptedRunner>,
        bell: Arc<CountingBell>,
        executor: ValidationExecutor,
    }

    fn fixture(commands: ValidationCommands, pre_commit_installed: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let bell = Arc::new(CountingBell::default());
        let executor = ValidationExecutor::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            Arc::new(StaticChecker { installed: pre_commit_installed }),
            Arc::new(FsArtifactSaver::new(dir.path())),
            Arc::clone(&bell) as Arc<dyn Notifier>,
            commands,
        );
        Fixture { _dir: dir, runner, bell, executor }
    }

    fn checks(result: &StepResult) -> Vec<serde_json::Value> {
        result.metadata[META_VALIDATION_CHECKS].as_array().unwrap().clone()
    }

    #[tokio::test]
    async fn full_pipeline_passes() {
        let f = fixture(commands(), true);
        let mut task = Task::new("ws", "/tmp/ws", "demo");
        let step = StepDefinition::new("validate", StepType::Validation);

        let result = f
            .executor
            .execute(&CancellationToken::new(), &mut task, &step)
            .await
            .unwrap();

        assert_eq!(result.status, StepStatus::Success);
        let entries = checks(&result);
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| e["passed"] == true));
        assert!(result.artifact_path.as_deref().unwrap().ends_with("validation.json"));
        assert_eq!(f.bell.rings.load(Ordering::SeqCst), 0);
        assert_eq!(f.runner.calls(), vec!["fmt", "lint", "test", "pre-commit run"]);
    }

    #[tokio::test]
    async fn format_failure_short_circuits() {
        let mut cmds = commands();
        cmds.format = vec!["fmt-fail".into()];
        let f = fixture(cmds, true);
        let mut task = Task::new("ws", "/tmp/ws", "demo");
        let step = StepDefinition::new("validate", StepType::Validation);

        let err = f
            .executor
            .execute(&CancellationToken::new(), &mut task, &step)
            .await
            .unwrap_err();

        let result = err.step_result().unwrap();
        assert!(result.error.as_deref().unwrap().contains("validation failed: format"));
        // Lint and test must not have run.
        assert_eq!(f.runner.calls(), vec!["fmt-fail"]);
        let entries = checks(result);
        assert_eq!(entries[0]["passed"], false);
        assert_eq!(entries[1]["passed"], true, "empty lint results count as passed");
    }

    #[tokio::test]
    async fn lint_failure_still_runs_test_but_not_pre_commit() {
        let mut cmds = commands();
        cmds.lint = vec!["lint-fail".into()];
        let f = fixture(cmds, true);
        let mut task = Task::new("ws", "/tmp/ws", "demo");
        let step = StepDefinition::new("validate", StepType::Validation);

        let err = f
            .executor
            .execute(&CancellationToken::new(), &mut task, &step)
            .await
            .unwrap_err();

        let calls = f.runner.calls();
        assert!(calls.contains(&"lint-fail".to_string()));
        assert!(calls.contains(&"test".to_string()), "test runs even when lint fails");
        assert!(!calls.contains(&"pre-commit run".to_string()));
        assert_eq!(f.bell.rings.load(Ordering::SeqCst), 1, "bell rings once");

        let result = err.step_result().unwrap();
        assert!(result.output.contains("lint-fail: broken"));
    }

    #[tokio::test]
    async fn missing_pre_commit_is_skip_not_failure() {
        let f = fixture(commands(), false);
        let mut task = Task::new("ws", "/tmp/ws", "demo");
        let step = StepDefinition::new("validate", StepType::Validation);

        let result = f
            .executor
            .execute(&CancellationToken::new(), &mut task, &step)
            .await
            .unwrap();

        assert_eq!(result.status, StepStatus::Success);
        let pipeline: PipelineResult =
            serde_json::from_value(result.metadata[META_PIPELINE_RESULT].clone()).unwrap();
        assert!(pipeline.success);
        assert_eq!(pipeline.skipped_steps, vec![CATEGORY_PRE_COMMIT]);
        assert!(pipeline.skip_reasons[CATEGORY_PRE_COMMIT].contains("not installed"));

        let entries = checks(&result);
        assert_eq!(entries[3]["skipped"], true);
        assert_eq!(entries[3]["passed"], true);
    }

    #[tokio::test]
    async fn detect_only_succeeds_and_flags_failure() {
        let mut cmds = commands();
        cmds.test = vec!["test-fail".into()];
        let f = fixture(cmds, true);
        let mut task = Task::new("ws", "/tmp/ws", "demo");
        let mut step = StepDefinition::new("validate", StepType::Validation);
        step.config = serde_json::json!({ "detect_only": true })
            .as_object()
            .cloned()
            .unwrap();

        let result = f
            .executor
            .execute(&CancellationToken::new(), &mut task, &step)
            .await
            .unwrap();

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.metadata[META_VALIDATION_FAILED], true);
        assert_eq!(result.metadata[META_DETECT_ONLY], true);
        assert_eq!(f.bell.rings.load(Ordering::SeqCst), 0, "no bell in detect-only mode");
    }

    #[tokio::test]
    async fn empty_commands_pass_vacuously() {
        let f = fixture(ValidationCommands::default(), true);
        let mut task = Task::new("ws", "/tmp/ws", "demo");
        let step = StepDefinition::new("validate", StepType::Validation);

        let result = f
            .executor
            .execute(&CancellationToken::new(), &mut task, &step)
            .await
            .unwrap();
        assert_eq!(result.status, StepStatus::Success);
        assert!(f.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn legacy_fallback_feeds_test_category() {
        let mut cmds = commands();
        cmds.test = Vec::new();
        let f = fixture(cmds, true);
        let mut task = Task::new("ws", "/tmp/ws", "demo");
        task.config.validation_commands = vec!["legacy-test".into()];
        let step = StepDefinition::new("validate", StepType::Validation);

        f.executor
            .execute(&CancellationToken::new(), &mut task, &step)
            .await
            .unwrap();
        assert!(f.runner.calls().contains(&"legacy-test".to_string()));
    }

    #[tokio::test]
    async fn cancellation_propagates_bare() {
        let f = fixture(commands(), true);
        let mut task = Task::new("ws", "/tmp/ws", "demo");
        let step = StepDefinition::new("validate", StepType::Validation);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f.executor.execute(&cancel, &mut task, &step).await.unwrap_err();
        assert!(matches!(err, StepError::Canceled));
    }

    #[test]
    fn failure_block_lists_only_failures_with_tail() {
        let pipeline = PipelineResult {
            success: false,
            failed_step: Some(CATEGORY_LINT.to_string()),
            lint_results: vec![
                CommandOutput {
                    command: "lint".into(),
                    stdout: "noise\nerror: bad".into(),
                    stderr: String::new(),
                    exit_code: 1,
                    success: false,
                    duration_ms: 5,
                },
                CommandOutput {
                    command: "lint --quiet".into(),
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                    success: true,
                    duration_ms: 2,
                },
            ],
            ..PipelineResult::default()
        };

        let block = format_failure_block(&pipeline);
        assert!(block.contains("FAILED [lint]: lint (exit 1)"));
        assert!(block.contains("error: bad"));
        assert!(!block.contains("lint --quiet"));
    }
}

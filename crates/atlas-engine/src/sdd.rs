//! Specification-driven development step.
//!
//! Drives the external spec CLI through the AI backend with single-line
//! prompts (`/{tool}.{command}`). The CLI-on-PATH precondition is probed
//! once per process; the memo is a lazily initialized, mutex-guarded
//! one-shot with test-only reset and seed hooks.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use atlas_core::config::opt_str;
use atlas_core::{AIRequest, StepDefinition, StepResult, StepStatus, StepType, Task};

use crate::executor::{run_bounded, ExecutionResult, StepError, StepExecutor};
use crate::interfaces::{AIRunner, ArtifactSaver, RunnerError, ToolChecker, ToolStatus};

/// Tool prefix used in slash-command prompts.
pub const DEFAULT_TOOL: &str = "speckit";

fn probe_memo() -> &'static Mutex<Option<ToolStatus>> {
    static MEMO: OnceLock<Mutex<Option<ToolStatus>>> = OnceLock::new();
    MEMO.get_or_init(|| Mutex::new(None))
}

#[cfg(test)]
async fn reset_probe_memo() {
    *probe_memo().lock().await = None;
}

#[cfg(test)]
async fn seed_probe_memo(status: ToolStatus) {
    *probe_memo().lock().await = Some(status);
}

/// Spec CLI sub-command selected by `sdd_command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SddCommand {
    Specify,
    Plan,
    Tasks,
    Implement,
    Checklist,
    /// Unrecognized commands are passed through rather than rejected.
    Other(String),
}

impl SddCommand {
    pub fn from_step(step: &StepDefinition) -> Self {
        match opt_str(&step.config, "sdd_command") {
            None | Some("specify") => Self::Specify,
            Some("plan") => Self::Plan,
            Some("tasks") => Self::Tasks,
            Some("implement") => Self::Implement,
            Some("checklist") => Self::Checklist,
            Some(other) => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Specify => "specify",
            Self::Plan => "plan",
            Self::Tasks => "tasks",
            Self::Implement => "implement",
            Self::Checklist => "checklist",
            Self::Other(name) => name,
        }
    }

    /// Semantic artifact name, or a timestamped fallback for pass-through
    /// commands. `implement` mutates the worktree and saves nothing.
    fn artifact_name(&self) -> Option<String> {
        match self {
            Self::Specify => Some("spec.md".to_string()),
            Self::Plan => Some("plan.md".to_string()),
            Self::Tasks => Some("tasks.md".to_string()),
            Self::Checklist => Some("checklist.md".to_string()),
            Self::Implement => None,
            Self::Other(_) => Some(format!("sdd-{}.md", Utc::now().format("%Y%m%d%H%M%S"))),
        }
    }
}

/// Executes `sdd` steps.
pub struct SDDExecutor {
    ai: Arc<dyn AIRunner>,
    checker: Arc<dyn ToolChecker>,
    artifacts: Arc<dyn ArtifactSaver>,
    tool: String,
}

impl SDDExecutor {
    pub fn new(
        ai: Arc<dyn AIRunner>,
        checker: Arc<dyn ToolChecker>,
        artifacts: Arc<dyn ArtifactSaver>,
    ) -> Self {
        Self {
            ai,
            checker,
            artifacts,
            tool: DEFAULT_TOOL.to_string(),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    /// Probe for the spec CLI, paying the cost exactly once per process.
    async fn ensure_tool(&self, cancel: &CancellationToken) -> Result<ToolStatus, RunnerError> {
        let mut memo = probe_memo().lock().await;
        if let Some(status) = memo.as_ref() {
            return Ok(status.clone());
        }
        let status = self.checker.is_tool_installed(cancel).await?;
        *memo = Some(status.clone());
        Ok(status)
    }

    fn build_prompt(&self, command: &SddCommand, task: &Task) -> String {
        let mut prompt = format!("/{}.{}", self.tool, command.as_str());
        if *command == SddCommand::Specify {
            prompt.push(' ');
            prompt.push_str(&task.description);
        }
        prompt
    }
}

#[async_trait]
impl StepExecutor for SDDExecutor {
    fn step_type(&self) -> StepType {
        StepType::Sdd
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

        let status = match self.ensure_tool(cancel).await {
            Ok(status) => status,
            Err(RunnerError::Canceled) => return Err(StepError::Canceled),
            Err(e) => return Err(StepError::fail(result, format!("spec CLI probe failed: {e}"))),
        };
        if !status.installed {
            return Err(StepError::fail(
                result,
                format!(
                    "spec CLI '{}' was not found on PATH; install it and re-run this step",
                    self.tool
                ),
            ));
        }

        let command = SddCommand::from_step(step);
        let prompt = self.build_prompt(&command, task);
        info!(step = step.name.as_str(), prompt = prompt.as_str(), "running spec command");

        let request = AIRequest {
            agent: task.config.agent,
            prompt,
            model: task.config.model.clone(),
            max_turns: task.config.max_turns,
            permission_mode: task.config.permission_mode.clone(),
            timeout_secs: task.config.timeout_secs,
            working_dir: task.workspace_root.clone(),
        };

        let child = cancel.child_token();
        let outcome = run_bounded(step.timeout, self.ai.run(&child, request)).await;
        if matches!(outcome, Err(RunnerError::Timeout(_))) {
            child.cancel();
        }

        let ai_result = match outcome {
            Ok(ai_result) => ai_result,
            Err(RunnerError::Canceled) => return Err(StepError::Canceled),
            Err(e) => {
                return Err(StepError::fail(result, format!("spec command failed: {e}")));
            }
        };

        if ai_result.output.trim().is_empty() {
            return Err(StepError::fail(
                result,
                format!("spec command '{}' returned empty output", command.as_str()),
            ));
        }

        if let Some(artifact) = command.artifact_name() {
            let base_name = format!("{}/{artifact}", step.name);
            match self
                .artifacts
                .save_versioned_artifact(
                    &task.workspace_id,
                    task.id.as_ref(),
                    &base_name,
                    ai_result.output.as_bytes(),
                )
                .await
            {
                Ok(key) => result.artifact_path = Some(key),
                Err(e) => warn!(error = %e, "failed to save spec artifact"),
            }
        }

        result.output = ai_result.output;
        result.session_id = ai_result.session_id;
        result.num_turns = ai_result.num_turns;
        result.files_changed = ai_result.files_changed;
        Ok(result.finish(StepStatus::Success))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FsArtifactSaver;
    use atlas_core::AIResult;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Serializes tests that touch the process-wide probe memo.
    fn memo_guard() -> std::sync::MutexGuard<'static, ()> {
        static GUARD: StdMutex<()> = StdMutex::new(());
        GUARD.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    struct ScriptedAI {
        output: String,
        last_prompt: StdMutex<Option<String>>,
    }

    impl ScriptedAI {
        fn new(output: &str) -> Self {
            Self {
                output: output.to_string(),
                last_prompt: StdMutex::new(None),
            }
        }
    }

    #[async_trait]
    impl AIRunner for ScriptedAI {
        async fn run(
            &self,
            _cancel: &CancellationToken,
            request: AIRequest,
        ) -> Result<AIResult, RunnerError> {
            *self.last_prompt.lock().unwrap() = Some(request.prompt);
            Ok(AIResult {
                output: self.output.clone(),
                ..AIResult::default()
            })
        }
    }

    /// Counts probe invocations so memoization is observable.
    #[derive(Default)]
    struct CountingChecker {
        installed: bool,
        probes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ToolChecker for CountingChecker {
        async fn is_tool_installed(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<ToolStatus, RunnerError> {
            self.probes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ToolStatus {
                installed: self.installed,
                version: self.installed.then(|| "0.4.1".to_string()),
            })
        }
    }

    fn setup(
        ai: Arc<ScriptedAI>,
        checker: Arc<CountingChecker>,
    ) -> (TempDir, SDDExecutor) {
        let dir = TempDir::new().unwrap();
        let executor = SDDExecutor::new(
            ai,
            checker,
            Arc::new(FsArtifactSaver::new(dir.path())),
        );
        (dir, executor)
    }

    fn sdd_step(command: Option<&str>) -> StepDefinition {
        let mut step = StepDefinition::new("spec", StepType::Sdd);
        if let Some(command) = command {
            step.config = json!({ "sdd_command": command }).as_object().cloned().unwrap();
        }
        step
    }

    #[test]
    fn command_parsing_defaults_to_specify() {
        assert_eq!(SddCommand::from_step(&sdd_step(None)), SddCommand::Specify);
        assert_eq!(SddCommand::from_step(&sdd_step(Some("plan"))), SddCommand::Plan);
        assert_eq!(
            SddCommand::from_step(&sdd_step(Some("refine"))),
            SddCommand::Other("refine".to_string())
        );
    }

    #[test]
    fn artifact_names_are_semantic() {
        assert_eq!(SddCommand::Specify.artifact_name().as_deref(), Some("spec.md"));
        assert_eq!(SddCommand::Tasks.artifact_name().as_deref(), Some("tasks.md"));
        assert_eq!(SddCommand::Implement.artifact_name(), None);
        let fallback = SddCommand::Other("refine".into()).artifact_name().unwrap();
        assert!(fallback.starts_with("sdd-") && fallback.ends_with(".md"));
    }

    #[tokio::test]
    async fn specify_appends_description_and_saves_spec() {
        let _guard = memo_guard();
        reset_probe_memo().await;

        let ai = Arc::new(ScriptedAI::new("# Spec\ndetails"));
        let checker = Arc::new(CountingChecker { installed: true, ..Default::default() });
        let (_dir, executor) = setup(Arc::clone(&ai), checker);

        let mut task = Task::new("ws", "/tmp/ws", "build a cache layer");
        let result = executor
            .execute(&CancellationToken::new(), &mut task, &sdd_step(None))
            .await
            .unwrap();

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(
            ai.last_prompt.lock().unwrap().as_deref(),
            Some("/speckit.specify build a cache layer")
        );
        assert!(result.artifact_path.as_deref().unwrap().ends_with("spec.md"));
    }

    #[tokio::test]
    async fn plan_omits_description() {
        let _guard = memo_guard();
        reset_probe_memo().await;
        seed_probe_memo(ToolStatus { installed: true, version: None }).await;

        let ai = Arc::new(ScriptedAI::new("plan body"));
        let checker = Arc::new(CountingChecker { installed: true, ..Default::default() });
        let (_dir, executor) = setup(Arc::clone(&ai), checker);

        let mut task = Task::new("ws", "/tmp/ws", "build a cache layer");
        executor
            .execute(&CancellationToken::new(), &mut task, &sdd_step(Some("plan")))
            .await
            .unwrap();

        assert_eq!(ai.last_prompt.lock().unwrap().as_deref(), Some("/speckit.plan"));
    }

    #[tokio::test]
    async fn probe_is_memoized_across_executions() {
        let _guard = memo_guard();
        reset_probe_memo().await;

        let ai = Arc::new(ScriptedAI::new("output"));
        let checker = Arc::new(CountingChecker { installed: true, ..Default::default() });
        let (_dir, executor) = setup(ai, Arc::clone(&checker));

        let mut task = Task::new("ws", "/tmp/ws", "demo");
        for _ in 0..3 {
            executor
                .execute(&CancellationToken::new(), &mut task, &sdd_step(Some("tasks")))
                .await
                .unwrap();
        }
        assert_eq!(checker.probes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_cli_fails_with_guidance() {
        let _guard = memo_guard();
        reset_probe_memo().await;
        seed_probe_memo(ToolStatus { installed: false, version: None }).await;

        let ai = Arc::new(ScriptedAI::new("unused"));
        let checker = Arc::new(CountingChecker::default());
        let (_dir, executor) = setup(ai, checker);

        let mut task = Task::new("ws", "/tmp/ws", "demo");
        let err = executor
            .execute(&CancellationToken::new(), &mut task, &sdd_step(None))
            .await
            .unwrap_err();
        let result = err.step_result().unwrap();
        assert!(result.error.as_deref().unwrap().contains("not found on PATH"));
    }

    #[tokio::test]
    async fn empty_output_is_a_failure() {
        let _guard = memo_guard();
        reset_probe_memo().await;
        seed_probe_memo(ToolStatus { installed: true, version: None }).await;

        let ai = Arc::new(ScriptedAI::new("   \n"));
        let checker = Arc::new(CountingChecker::default());
        let (_dir, executor) = setup(ai, checker);

        let mut task = Task::new("ws", "/tmp/ws", "demo");
        let err = executor
            .execute(&CancellationToken::new(), &mut task, &sdd_step(Some("checklist")))
            .await
            .unwrap_err();
        assert!(err
            .step_result()
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("returned empty output"));
    }

    #[tokio::test]
    async fn retries_version_artifacts() {
        let _guard = memo_guard();
        reset_probe_memo().await;
        seed_probe_memo(ToolStatus { installed: true, version: None }).await;

        let ai = Arc::new(ScriptedAI::new("# Spec"));
        let checker = Arc::new(CountingChecker::default());
        let (_dir, executor) = setup(ai, checker);

        let mut task = Task::new("ws", "/tmp/ws", "demo");
        let first = executor
            .execute(&CancellationToken::new(), &mut task, &sdd_step(None))
            .await
            .unwrap();
        let second = executor
            .execute(&CancellationToken::new(), &mut task, &sdd_step(None))
            .await
            .unwrap();

        assert!(first.artifact_path.as_deref().unwrap().ends_with("spec.md"));
        assert!(second.artifact_path.as_deref().unwrap().ends_with("spec.1.md"));
    }
}

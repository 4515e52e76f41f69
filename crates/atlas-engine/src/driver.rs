//! Minimal template driver.
//!
//! Walks a template's steps in order from `task.current_step`, dispatching
//! through the executor registry and appending each result to the task.
//! Required-step failures and approval gates stop the walk; optional
//! failures are recorded and skipped over. The engine also implements the
//! loop step's `InnerStepRunner`, closing the recursion between the loop
//! executor and step dispatch.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use atlas_core::{StepDefinition, StepStatus, Task, Template};

use crate::ai::AIExecutor;
use crate::ci::CIExecutor;
use crate::executor::{ExecutionResult, ExecutorRegistry, InnerStepRunner, StepError};
use crate::interfaces::{
    AIRunner, ArtifactSaver, CommandRunner, HubRunner, LoopStateStore, Notifier, ToolChecker,
};
use crate::loop_step::LoopExecutor;
use crate::sdd::SDDExecutor;
use crate::validation::{ValidationCommands, ValidationExecutor};
use crate::verify::VerifyExecutor;
use crate::AppResult;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task canceled")]
    Canceled,
}

/// How a template walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRunOutcome {
    Completed,
    /// A step yielded to a human; `current_step` still points at it.
    AwaitingApproval { step: usize },
    /// A required step failed.
    Failed { step: usize, reason: String },
}

/// External collaborators the engine wires into its executors.
pub struct EngineDeps {
    pub ai: Arc<dyn AIRunner>,
    pub commands: Arc<dyn CommandRunner>,
    pub hub: Arc<dyn HubRunner>,
    pub sdd_checker: Arc<dyn ToolChecker>,
    pub pre_commit_checker: Arc<dyn ToolChecker>,
    pub artifacts: Arc<dyn ArtifactSaver>,
    pub state_store: Arc<dyn LoopStateStore>,
    pub notifier: Arc<dyn Notifier>,
    pub validation_commands: ValidationCommands,
    /// Root directory for loop scratchpads.
    pub artifacts_root: PathBuf,
}

/// Step engine: one executor per step type plus the template walk.
pub struct Engine {
    registry: ExecutorRegistry,
}

impl Engine {
    /// Wire every executor. The loop executor gets an inner runner backed by
    /// this same engine, created through `Arc::new_cyclic` so the recursion
    /// needs no locks.
    pub fn new(deps: EngineDeps) -> Arc<Self> {
        Self::build(deps, false)
    }

    /// An engine whose executors report what they would do without doing it.
    pub fn new_dry_run(deps: EngineDeps) -> Arc<Self> {
        Self::build(deps, true)
    }

    fn build(deps: EngineDeps, dry_run: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let inner_runner = Arc::new(EngineInnerRunner { engine: weak.clone() });

            let mut registry = ExecutorRegistry::new();
            registry.register(Arc::new(AIExecutor::new(
                Arc::clone(&deps.ai),
                Arc::clone(&deps.artifacts),
            )));
            registry.register(Arc::new(ValidationExecutor::new(
                Arc::clone(&deps.commands),
                Arc::clone(&deps.pre_commit_checker),
                Arc::clone(&deps.artifacts),
                Arc::clone(&deps.notifier),
                deps.validation_commands.clone(),
            )));
            registry.register(Arc::new(CIExecutor::new(
                Arc::clone(&deps.hub),
                Arc::clone(&deps.artifacts),
            )));
            registry.register(Arc::new(SDDExecutor::new(
                Arc::clone(&deps.ai),
                Arc::clone(&deps.sdd_checker),
                Arc::clone(&deps.artifacts),
            )));
            registry.register(Arc::new(VerifyExecutor::new(
                Arc::clone(&deps.ai),
                Arc::clone(&deps.commands),
                Arc::clone(&deps.artifacts),
            )));
            registry.register(Arc::new(LoopExecutor::new(
                inner_runner,
                Arc::clone(&deps.state_store),
                deps.artifacts_root.clone(),
            )));

            let registry = if dry_run { registry.dry_run() } else { registry };
            Self { registry }
        })
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Walk the template from `task.current_step`, appending results.
    pub async fn run_task(
        &self,
        cancel: &CancellationToken,
        task: &mut Task,
        template: &Template,
    ) -> AppResult<TaskRunOutcome> {
        info!(
            task_id = %task.id,
            template = template.name.as_str(),
            from_step = task.current_step,
            "running task"
        );

        while task.current_step < template.steps.len() {
            let index = task.current_step;
            let step = &template.steps[index];
            let mut attempt = 0u32;

            loop {
                match self.registry.execute(cancel, task, step).await {
                    Ok(result) => {
                        let status = result.status;
                        task.step_results.push(result);
                        if status == StepStatus::AwaitingApproval {
                            info!(step = step.name.as_str(), "step awaits approval; pausing task");
                            return Ok(TaskRunOutcome::AwaitingApproval { step: index });
                        }
                        task.current_step = index + 1;
                        break;
                    }
                    Err(StepError::Canceled) => {
                        return Err(eyre::Report::new(EngineError::Canceled));
                    }
                    Err(StepError::Failed { result, reason }) => {
                        task.step_results.push(*result);
                        // Retry decisions belong to the driver; the step's
                        // retry_count is the bound.
                        if attempt < step.retry_count {
                            attempt += 1;
                            warn!(
                                step = step.name.as_str(),
                                attempt,
                                reason = reason.as_str(),
                                "step failed; retrying"
                            );
                            continue;
                        }
                        if step.required {
                            warn!(step = step.name.as_str(), reason = reason.as_str(), "required step failed");
                            return Ok(TaskRunOutcome::Failed { step: index, reason });
                        }
                        warn!(step = step.name.as_str(), reason = reason.as_str(), "optional step failed; continuing");
                        task.current_step = index + 1;
                        break;
                    }
                }
            }
        }

        Ok(TaskRunOutcome::Completed)
    }
}

/// Inner-step runner handed to the loop executor.
struct EngineInnerRunner {
    engine: Weak<Engine>,
}

#[async_trait]
impl InnerStepRunner for EngineInnerRunner {
    async fn execute_step(
        &self,
        cancel: &CancellationToken,
        task: &mut Task,
        step: &StepDefinition,
    ) -> ExecutionResult {
        let Some(engine) = self.engine.upgrade() else {
            let result = atlas_core::StepResult::begin(task.current_step, &step.name);
            return Err(StepError::fail(result, "engine was dropped mid-loop"));
        };
        engine.registry.execute(cancel, task, step).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FsArtifactSaver;
    use crate::command::ShellRunner;
    use crate::state_store::FsLoopStateStore;
    use atlas_core::{AIRequest, AIResult, CIWatchOptions, CIWatchResult, CommandOutput};
    use crate::interfaces::{RunnerError, ToolStatus};
    use tempfile::TempDir;

    struct OkAI;

    #[async_trait]
    impl AIRunner for OkAI {
        async fn run(
            &self,
            _cancel: &CancellationToken,
            _request: AIRequest,
        ) -> Result<AIResult, RunnerError> {
            Ok(AIResult {
                output: "done".to_string(),
                files_changed: vec!["src/lib.rs".to_string()],
                ..AIResult::default()
            })
        }
    }

    struct NoHub;

    #[async_trait]
    impl HubRunner for NoHub {
        async fn watch_pr_checks(
            &self,
            _cancel: &CancellationToken,
            _options: &CIWatchOptions,
        ) -> Result<CIWatchResult, RunnerError> {
            Err(RunnerError::other("no hub in tests"))
        }

        async fn create_pr(
            &self,
            _cancel: &CancellationToken,
            _title: &str,
            _body: &str,
            _base: &str,
        ) -> Result<i64, RunnerError> {
            Err(RunnerError::other("no hub in tests"))
        }

        async fn get_pr_status(
            &self,
            _cancel: &CancellationToken,
            _pr_number: i64,
        ) -> Result<String, RunnerError> {
            Err(RunnerError::other("no hub in tests"))
        }

        async fn merge_pr(
            &self,
            _cancel: &CancellationToken,
            _pr_number: i64,
        ) -> Result<(), RunnerError> {
            Err(RunnerError::other("no hub in tests"))
        }

        async fn convert_to_draft(
            &self,
            _cancel: &CancellationToken,
            _pr_number: i64,
        ) -> Result<(), RunnerError> {
            Err(RunnerError::other("no hub in tests"))
        }

        async fn add_pr_review(
            &self,
            _cancel: &CancellationToken,
            _pr_number: i64,
            _body: &str,
        ) -> Result<(), RunnerError> {
            Err(RunnerError::other("no hub in tests"))
        }

        async fn add_pr_comment(
            &self,
            _cancel: &CancellationToken,
            _pr_number: i64,
            _body: &str,
        ) -> Result<(), RunnerError> {
            Err(RunnerError::other("no hub in tests"))
        }
    }

    struct ToolPresent;

    #[async_trait]
    impl ToolChecker for ToolPresent {
        async fn is_tool_installed(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<ToolStatus, RunnerError> {
            Ok(ToolStatus { installed: true, version: None })
        }
    }

    struct SilentBell;

    impl Notifier for SilentBell {
        fn bell(&self) {}
    }

    struct FailingCommands;

    #[async_trait]
    impl CommandRunner for FailingCommands {
        async fn run(
            &self,
            _cancel: &CancellationToken,
            _work_dir: &std::path::Path,
            command: &str,
        ) -> Result<CommandOutput, RunnerError> {
            Ok(CommandOutput {
                command: command.to_string(),
                stdout: String::new(),
                stderr: "nope".to_string(),
                exit_code: 1,
                success: false,
                duration_ms: 1,
            })
        }
    }

    fn deps(dir: &TempDir, commands: ValidationCommands) -> EngineDeps {
        EngineDeps {
            ai: Arc::new(OkAI),
            commands: Arc::new(ShellRunner),
            hub: Arc::new(NoHub),
            sdd_checker: Arc::new(ToolPresent),
            pre_commit_checker: Arc::new(ToolPresent),
            artifacts: Arc::new(FsArtifactSaver::new(dir.path().join("artifacts"))),
            state_store: Arc::new(FsLoopStateStore::new(dir.path().join("artifacts"))),
            notifier: Arc::new(SilentBell),
            validation_commands: commands,
            artifacts_root: dir.path().join("artifacts"),
        }
    }

    fn template(yaml: &str) -> Template {
        Template::from_yaml(yaml).unwrap()
    }

    fn new_task(dir: &TempDir) -> Task {
        let workspace = dir.path().join("work");
        std::fs::create_dir_all(&workspace).unwrap();
        Task::new("ws", workspace, "demo task")
    }

    #[tokio::test]
    async fn walks_template_to_completion() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(deps(&dir, ValidationCommands::default()));
        let mut task = new_task(&dir);
        let template = template(
            r"
name: feature
steps:
  - name: implement
    type: ai
  - name: validate
    type: validation
",
        );

        let outcome = engine
            .run_task(&CancellationToken::new(), &mut task, &template)
            .await
            .unwrap();

        assert_eq!(outcome, TaskRunOutcome::Completed);
        assert_eq!(task.step_results.len(), 2);
        assert_eq!(task.current_step, 2);
        assert!(task.step_results.iter().all(|r| r.status == StepStatus::Success));
    }

    #[tokio::test]
    async fn required_failure_stops_the_walk() {
        let dir = TempDir::new().unwrap();
        let mut d = deps(&dir, ValidationCommands {
            test: vec!["always-fails".into()],
            ..ValidationCommands::default()
        });
        d.commands = Arc::new(FailingCommands);
        let engine = Engine::new(d);
        let mut task = new_task(&dir);
        let template = template(
            r"
name: feature
steps:
  - name: validate
    type: validation
  - name: implement
    type: ai
",
        );

        let outcome = engine
            .run_task(&CancellationToken::new(), &mut task, &template)
            .await
            .unwrap();

        assert!(matches!(outcome, TaskRunOutcome::Failed { step: 0, .. }));
        assert_eq!(task.step_results.len(), 1, "failed result is still recorded");
        assert_eq!(task.current_step, 0);
    }

    #[tokio::test]
    async fn optional_failure_continues() {
        let dir = TempDir::new().unwrap();
        let mut d = deps(&dir, ValidationCommands {
            test: vec!["always-fails".into()],
            ..ValidationCommands::default()
        });
        d.commands = Arc::new(FailingCommands);
        let engine = Engine::new(d);
        let mut task = new_task(&dir);
        let template = template(
            r"
name: feature
steps:
  - name: validate
    type: validation
    required: false
  - name: implement
    type: ai
",
        );

        let outcome = engine
            .run_task(&CancellationToken::new(), &mut task, &template)
            .await
            .unwrap();

        assert_eq!(outcome, TaskRunOutcome::Completed);
        assert_eq!(task.step_results.len(), 2);
        assert_eq!(task.step_results[0].status, StepStatus::Failed);
        assert_eq!(task.step_results[1].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn failed_step_is_retried_up_to_retry_count() {
        let dir = TempDir::new().unwrap();
        let mut d = deps(&dir, ValidationCommands {
            test: vec!["always-fails".into()],
            ..ValidationCommands::default()
        });
        d.commands = Arc::new(FailingCommands);
        let engine = Engine::new(d);
        let mut task = new_task(&dir);
        let template = template(
            r"
name: feature
steps:
  - name: validate
    type: validation
    retry_count: 2
",
        );

        let outcome = engine
            .run_task(&CancellationToken::new(), &mut task, &template)
            .await
            .unwrap();

        assert!(matches!(outcome, TaskRunOutcome::Failed { step: 0, .. }));
        assert_eq!(task.step_results.len(), 3, "initial attempt plus two retries");
        assert!(task
            .step_results
            .iter()
            .all(|r| r.status == StepStatus::Failed));
    }

    #[tokio::test]
    async fn loop_step_recurses_through_the_engine() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(deps(&dir, ValidationCommands::default()));
        let mut task = new_task(&dir);
        let template = template(
            r#"
name: feature
steps:
  - name: improve
    type: loop
    config:
      max_iterations: 2
      steps:
        - name: fix
          type: ai
"#,
        );

        let outcome = engine
            .run_task(&CancellationToken::new(), &mut task, &template)
            .await
            .unwrap();

        assert_eq!(outcome, TaskRunOutcome::Completed);
        let loop_result = &task.step_results[0];
        assert_eq!(loop_result.metadata["iterations_completed"], 2);
        // Two iterations, one AI inner step each.
        assert_eq!(loop_result.files_changed.len(), 2);
    }

    #[tokio::test]
    async fn dry_run_reports_without_executing() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new_dry_run(deps(&dir, ValidationCommands::default()));
        let mut task = new_task(&dir);
        let template = template(
            r"
name: feature
steps:
  - name: implement
    type: ai
  - name: verify
    type: verify
",
        );

        let outcome = engine
            .run_task(&CancellationToken::new(), &mut task, &template)
            .await
            .unwrap();

        assert_eq!(outcome, TaskRunOutcome::Completed);
        assert!(task
            .step_results
            .iter()
            .all(|r| r.status == StepStatus::WouldExecute));
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_engine_error() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(deps(&dir, ValidationCommands::default()));
        let mut task = new_task(&dir);
        let template = template(
            r"
name: feature
steps:
  - name: implement
    type: ai
",
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine
            .run_task(&cancel, &mut task, &template)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<EngineError>().is_some());
        assert!(task.step_results.is_empty());
    }
}

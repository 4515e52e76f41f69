//! Multi-check verification step.
//!
//! Combines an AI review of the changed files with deterministic detectors
//! (missing sibling tests, garbage files in the staging area, hardcoded
//! secrets), assembles a `VerificationReport`, and writes the markdown
//! rendering as `verify/verification-report.md`.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use atlas_core::config::{opt_str, opt_string_list};
use atlas_core::{
    AIRequest, Issue, Severity, StepDefinition, StepResult, StepStatus, StepType, Task,
    VerificationReport,
};

use crate::executor::{run_bounded, ExecutionResult, StepError, StepExecutor};
use crate::interfaces::{AIRunner, ArtifactSaver, CommandRunner, RunnerError};

pub const CHECK_CODE_CORRECTNESS: &str = "code_correctness";
pub const CHECK_TEST_COVERAGE: &str = "test_coverage";
pub const CHECK_GARBAGE_FILES: &str = "garbage_files";
pub const CHECK_SECURITY: &str = "security";

/// All checks, in execution order.
const ALL_CHECKS: [&str; 4] = [
    CHECK_CODE_CORRECTNESS,
    CHECK_TEST_COVERAGE,
    CHECK_GARBAGE_FILES,
    CHECK_SECURITY,
];

/// Files larger than this are not shipped to the AI reviewer.
const MAX_REVIEW_FILE_BYTES: u64 = 64 * 1024;

/// Source extensions the coverage check cares about.
const SOURCE_EXTENSIONS: [&str; 5] = ["rs", "go", "py", "ts", "js"];

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"(?i)(api[_-]?key|secret|password|token)\s*[:=]\s*["'][^"']{8,}["']"#,
            r"sk-[A-Za-z0-9]{20,}",
            r"-----BEGIN [A-Z ]*PRIVATE KEY-----",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
    })
}

/// What to do with the issues a verification run surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueAction {
    AutoFix,
    ManualFix,
    IgnoreContinue,
    ViewReport,
}

/// Outcome of dispatching an [`IssueAction`].
#[derive(Debug, Clone)]
pub enum IssueOutcome {
    /// Auto-fix ran and changed files.
    Fixed { files_changed: Vec<String> },
    /// Control yielded to a human.
    AwaitingManualFix,
    Ignored,
    Report(String),
}

/// Executes `verify` steps.
pub struct VerifyExecutor {
    ai: Arc<dyn AIRunner>,
    commands: Arc<dyn CommandRunner>,
    artifacts: Arc<dyn ArtifactSaver>,
}

impl VerifyExecutor {
    pub fn new(
        ai: Arc<dyn AIRunner>,
        commands: Arc<dyn CommandRunner>,
        artifacts: Arc<dyn ArtifactSaver>,
    ) -> Self {
        Self { ai, commands, artifacts }
    }

    /// Changed files accumulated across the task's step results, first
    /// occurrence wins.
    fn changed_files(task: &Task) -> Vec<String> {
        let mut files = Vec::new();
        for result in &task.step_results {
            for file in &result.files_changed {
                if !files.contains(file) {
                    files.push(file.clone());
                }
            }
        }
        files
    }

    fn is_test_file(path: &str) -> bool {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        path.contains("/tests/")
            || name.starts_with("test_")
            || name.contains("_test.")
            || name.contains(".test.")
    }

    /// AI review of changed-file contents against the task description.
    ///
    /// The reviewer answers `OK` when satisfied, otherwise one finding per
    /// line; each line becomes a warning.
    async fn check_code_correctness(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        model: Option<&str>,
        files: &[String],
    ) -> Result<Vec<Issue>, RunnerError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let mut prompt = format!(
            "Review the following changed files for correctness against this task:\n{}\n\n\
             Reply with OK if the changes look correct, otherwise list one concern per line.\n",
            task.description
        );
        for file in files {
            let path = task.workspace_root.join(file);
            let too_big = tokio::fs::metadata(&path)
                .await
                .map(|m| m.len() > MAX_REVIEW_FILE_BYTES)
                .unwrap_or(true);
            if too_big {
                continue;
            }
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                prompt.push_str(&format!("\n--- {file} ---\n{content}\n"));
            }
        }

        let request = AIRequest {
            agent: task.config.agent,
            prompt,
            model: model.unwrap_or(&task.config.model).to_string(),
            max_turns: task.config.max_turns,
            permission_mode: task.config.permission_mode.clone(),
            timeout_secs: task.config.timeout_secs,
            working_dir: task.workspace_root.clone(),
        };
        let review = self.ai.run(cancel, request).await?;

        let mut issues = Vec::new();
        let lines: Vec<&str> = review
            .output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if lines.first().is_some_and(|l| l.eq_ignore_ascii_case("ok")) {
            return Ok(issues);
        }
        for line in lines {
            issues.push(Issue {
                check: CHECK_CODE_CORRECTNESS.to_string(),
                severity: Severity::Warning,
                message: line.trim_start_matches("- ").to_string(),
                file: None,
                line: None,
            });
        }
        Ok(issues)
    }

    /// Changed source files without a sibling test file get a warning.
    fn check_test_coverage(task: &Task, files: &[String]) -> Vec<Issue> {
        let mut issues = Vec::new();
        for file in files {
            let path = Path::new(file);
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !SOURCE_EXTENSIONS.contains(&ext) || Self::is_test_file(file) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let dir = path.parent().unwrap_or_else(|| Path::new(""));
            let siblings = [
                dir.join(format!("{stem}_test.{ext}")),
                dir.join(format!("{stem}.test.{ext}")),
            ];
            let has_test = siblings
                .iter()
                .any(|candidate| task.workspace_root.join(candidate).exists());
            if !has_test {
                issues.push(Issue {
                    check: CHECK_TEST_COVERAGE.to_string(),
                    severity: Severity::Warning,
                    message: format!("no sibling test file for {file}"),
                    file: Some(file.clone()),
                    line: None,
                });
            }
        }
        issues
    }

    /// Inspect staged file names for debris that should not be committed.
    async fn check_garbage_files(
        &self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<Vec<Issue>, RunnerError> {
        let staged = match self
            .commands
            .run(cancel, &task.workspace_root, "git diff --cached --name-only")
            .await
        {
            Ok(output) if output.success => output.stdout,
            Ok(output) => {
                warn!(stderr = output.stderr.as_str(), "could not list staged files");
                return Ok(Vec::new());
            }
            Err(RunnerError::Canceled) => return Err(RunnerError::Canceled),
            Err(e) => {
                warn!(error = %e, "could not list staged files");
                return Ok(Vec::new());
            }
        };

        let mut issues = Vec::new();
        for path in staged.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let ext = Path::new(path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");

            let issue = if name.starts_with(".env") {
                Some((Severity::Error, "secret file staged"))
            } else if matches!(ext, "tmp" | "bak") {
                Some((Severity::Warning, "temporary file staged"))
            } else if name == "a.out" || matches!(ext, "o" | "obj" | "exe" | "bin") {
                Some((Severity::Warning, "possible debug binary staged"))
            } else {
                None
            };

            if let Some((severity, message)) = issue {
                issues.push(Issue {
                    check: CHECK_GARBAGE_FILES.to_string(),
                    severity,
                    message: format!("{message}: {path}"),
                    file: Some(path.to_string()),
                    line: None,
                });
            }
        }
        Ok(issues)
    }

    /// Scan changed-file contents for hardcoded secrets. Test files are
    /// excluded; fixtures legitimately hold fake credentials.
    async fn check_security(task: &Task, files: &[String]) -> Vec<Issue> {
        let mut issues = Vec::new();
        for file in files {
            if Self::is_test_file(file) {
                continue;
            }
            let Ok(content) = tokio::fs::read_to_string(task.workspace_root.join(file)).await
            else {
                continue;
            };
            for pattern in secret_patterns() {
                if let Some(found) = pattern.find(&content) {
                    let line = content[..found.start()].lines().count() as u32;
                    issues.push(Issue {
                        check: CHECK_SECURITY.to_string(),
                        severity: Severity::Error,
                        message: "possible hardcoded secret".to_string(),
                        file: Some(file.clone()),
                        line: Some(line.max(1)),
                    });
                    break;
                }
            }
        }
        issues
    }

    /// Dispatch a post-verification action chosen by the driver or a human.
    pub async fn handle_issues(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        report: &VerificationReport,
        action: IssueAction,
    ) -> Result<IssueOutcome, RunnerError> {
        match action {
            IssueAction::AutoFix => {
                let mut prompt = String::from("Fix the following verification issues:\n");
                for issue in &report.issues {
                    prompt.push_str(&format!(
                        "- [{}] {}{}\n",
                        issue.severity.as_str(),
                        issue.message,
                        issue.file.as_deref().map(|f| format!(" ({f})")).unwrap_or_default()
                    ));
                }
                let request = AIRequest {
                    agent: task.config.agent,
                    prompt,
                    model: task.config.model.clone(),
                    max_turns: task.config.max_turns,
                    permission_mode: task.config.permission_mode.clone(),
                    timeout_secs: task.config.timeout_secs,
                    working_dir: task.workspace_root.clone(),
                };
                let fixed = self.ai.run(cancel, request).await?;
                if fixed.files_changed.is_empty() {
                    return Err(RunnerError::other("auto-fix produced no file changes"));
                }
                Ok(IssueOutcome::Fixed { files_changed: fixed.files_changed })
            }
            IssueAction::ManualFix => Ok(IssueOutcome::AwaitingManualFix),
            IssueAction::IgnoreContinue => Ok(IssueOutcome::Ignored),
            IssueAction::ViewReport => Ok(IssueOutcome::Report(report.render_markdown())),
        }
    }
}

#[async_trait]
impl StepExecutor for VerifyExecutor {
    fn step_type(&self) -> StepType {
        StepType::Verify
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

        let selected = opt_string_list(&step.config, "checks");
        let checks: Vec<String> = if selected.is_empty() {
            ALL_CHECKS.iter().map(|c| (*c).to_string()).collect()
        } else {
            ALL_CHECKS
                .iter()
                .filter(|c| selected.iter().any(|s| s == *c))
                .map(|c| (*c).to_string())
                .collect()
        };
        let model = opt_str(&step.config, "model").map(str::to_string);
        let files = Self::changed_files(task);

        let started = std::time::Instant::now();
        let child = cancel.child_token();
        let gathered = run_bounded(step.timeout, async {
            let mut issues = Vec::new();
            for check in &checks {
                if child.is_cancelled() {
                    return Err(RunnerError::Canceled);
                }
                match check.as_str() {
                    CHECK_CODE_CORRECTNESS => issues.extend(
                        self.check_code_correctness(&child, task, model.as_deref(), &files)
                            .await?,
                    ),
                    CHECK_TEST_COVERAGE => issues.extend(Self::check_test_coverage(task, &files)),
                    CHECK_GARBAGE_FILES => {
                        issues.extend(self.check_garbage_files(&child, task).await?);
                    }
                    CHECK_SECURITY => issues.extend(Self::check_security(task, &files).await),
                    _ => {}
                }
            }
            Ok(issues)
        })
        .await;
        if matches!(gathered, Err(RunnerError::Timeout(_))) {
            child.cancel();
        }

        let issues = match gathered {
            Ok(issues) => issues,
            Err(RunnerError::Canceled) => return Err(StepError::Canceled),
            Err(e) => return Err(StepError::fail(result, format!("verification failed: {e}"))),
        };

        let report =
            VerificationReport::assemble(&checks, issues, started.elapsed().as_millis() as u64);
        info!(
            step = step.name.as_str(),
            errors = report.error_count,
            warnings = report.warning_count,
            "verification finished"
        );

        let markdown = report.render_markdown();
        match self
            .artifacts
            .save_artifact(
                &task.workspace_id,
                task.id.as_ref(),
                "verify/verification-report.md",
                markdown.as_bytes(),
            )
            .await
        {
            Ok(key) => result.artifact_path = Some(key),
            Err(e) => warn!(error = %e, "failed to save verification report"),
        }

        result.output = markdown;
        if report.passed() {
            Ok(result.finish(StepStatus::Success))
        } else {
            Err(StepError::fail(
                result,
                format!("verification found {} error(s)", report.error_count),
            ))
        }
    }
}

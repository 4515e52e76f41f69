//! Verification report model and markdown rendering.
//!
//! The verify step aggregates issues from multiple checks into a single
//! report, bucketed by severity, and renders a human-readable markdown
//! document written alongside the task's other artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issue severity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    fn marker(&self) -> &'static str {
        match self {
            Self::Error => "❌",
            Self::Warning => "⚠️",
            Self::Info => "ℹ️",
        }
    }
}

/// A single finding from one verification check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Check that produced the finding (e.g. `security`).
    pub check: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// Aggregate outcome of a verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub total_issues: usize,
    pub error_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub passed_checks: Vec<String>,
    pub failed_checks: Vec<String>,
    pub issues: Vec<Issue>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl VerificationReport {
    /// Assemble a report from the checks that ran and everything they found.
    ///
    /// A check fails when it produced at least one error-severity issue;
    /// warnings and info findings leave it passed.
    pub fn assemble(checks_run: &[String], issues: Vec<Issue>, duration_ms: u64) -> Self {
        let error_count = issues.iter().filter(|i| i.severity == Severity::Error).count();
        let warning_count = issues.iter().filter(|i| i.severity == Severity::Warning).count();
        let info_count = issues.iter().filter(|i| i.severity == Severity::Info).count();

        let mut passed_checks = Vec::new();
        let mut failed_checks = Vec::new();
        for check in checks_run {
            let has_error = issues
                .iter()
                .any(|i| &i.check == check && i.severity == Severity::Error);
            if has_error {
                failed_checks.push(check.clone());
            } else {
                passed_checks.push(check.clone());
            }
        }

        Self {
            total_issues: issues.len(),
            error_count,
            warning_count,
            info_count,
            passed_checks,
            failed_checks,
            issues,
            timestamp: Utc::now(),
            duration_ms,
        }
    }

    /// Whether the report is free of error-severity issues.
    pub fn passed(&self) -> bool {
        self.error_count == 0
    }

    /// Render the human-readable markdown report.
    pub fn render_markdown(&self) -> String {
        let mut md = String::new();
        md.push_str("# Verification Report\n\n");
        md.push_str(&format!(
            "Generated: {} | Duration: {}ms\n\n",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.duration_ms
        ));

        md.push_str("## Summary\n\n");
        md.push_str(&format!(
            "- Total issues: {} ({} errors, {} warnings, {} info)\n",
            self.total_issues, self.error_count, self.warning_count, self.info_count
        ));
        md.push_str(&format!("- Passed checks: {}\n", join_or_none(&self.passed_checks)));
        md.push_str(&format!("- Failed checks: {}\n", join_or_none(&self.failed_checks)));

        if self.issues.is_empty() {
            md.push_str("\nNo issues found.\n");
            return md;
        }

        md.push_str("\n## Issues\n");
        for check in self.checks_with_issues() {
            md.push_str(&format!("\n### {check}\n\n"));
            for issue in self.issues.iter().filter(|i| i.check == check) {
                let location = match (&issue.file, issue.line) {
                    (Some(file), Some(line)) => format!(" `{file}:{line}`"),
                    (Some(file), None) => format!(" `{file}`"),
                    _ => String::new(),
                };
                md.push_str(&format!(
                    "- {} **{}**{}: {}\n",
                    issue.severity.marker(),
                    issue.severity.as_str(),
                    location,
                    issue.message
                ));
            }
        }
        md
    }

    fn checks_with_issues(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for issue in &self.issues {
            if !seen.contains(&issue.check) {
                seen.push(issue.check.clone());
            }
        }
        seen
    }
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

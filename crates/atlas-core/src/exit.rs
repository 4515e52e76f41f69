//! Loop exit evaluation.
//!
//! Two independent gates can terminate a loop: an explicit signal emitted by
//! the AI inside its output (`{"exit": true}`, whitespace-tolerant), and an
//! optional set of exit conditions that must ALL appear in the combined
//! iteration output. When conditions are configured, the signal alone never
//! exits and the conditions alone never exit.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{StepStatus, Task};

fn exit_signal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"\{\s*"exit"\s*:\s*true\s*\}"#).expect("static pattern"))
}

/// Outcome of evaluating one iteration's combined output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitDecision {
    /// Whether the exit signal appeared anywhere in the output.
    pub signal_found: bool,
    /// Whether every configured condition matched (vacuously true when none).
    pub conditions_met: bool,
    /// Whether the loop should terminate.
    pub should_exit: bool,
    /// Conditions that did not match, for logging.
    pub missing_conditions: Vec<String>,
}

/// Evaluates the dual-gate exit policy for a loop step.
#[derive(Debug, Clone, Default)]
pub struct ExitEvaluator {
    conditions: Vec<String>,
}

impl ExitEvaluator {
    pub fn new(conditions: Vec<String>) -> Self {
        Self { conditions }
    }

    /// Check the combined iteration output against signal and conditions.
    pub fn evaluate(&self, output: &str) -> ExitDecision {
        let signal_found = exit_signal_pattern().is_match(output);

        if !signal_found {
            return ExitDecision {
                signal_found: false,
                conditions_met: false,
                should_exit: false,
                missing_conditions: Vec::new(),
            };
        }

        let lowered = output.to_lowercase();
        let missing_conditions: Vec<String> = self
            .conditions
            .iter()
            .filter(|c| !lowered.contains(&c.to_lowercase()))
            .cloned()
            .collect();
        let conditions_met = missing_conditions.is_empty();

        ExitDecision {
            signal_found,
            conditions_met,
            should_exit: conditions_met,
            missing_conditions,
        }
    }
}

/// Evaluate a named built-in `until` condition against task state.
///
/// Unknown names evaluate false rather than erroring, so templates stay
/// forward-compatible with conditions this build does not know.
pub fn evaluate_named_condition(name: &str, task: &Task) -> bool {
    match name {
        "all_tests_pass" | "validation_passed" => task
            .step_results
            .iter()
            .rev()
            .find(|r| r.step_name == "validate" || r.step_name.contains("validation"))
            .is_some_and(|r| r.status == StepStatus::Success),
        "no_changes" => task
            .last_result()
            .is_some_and(|r| r.files_changed.is_empty()),
        _ => false,
    }
}

pub mod config;
pub mod exit;
pub mod report;
pub mod state;
pub mod types;

pub use config::{ConfigError, LoopConfig, DEFAULT_CONSECUTIVE_ERRORS};
pub use exit::{evaluate_named_condition, ExitDecision, ExitEvaluator};
pub use report::{Issue, Severity, VerificationReport};
pub use state::{
    truncate_output, ExitReason, IterationResult, IterationSummary, LoopState, ScratchpadData,
    SUMMARY_MAX_CHARS,
};
pub use types::{
    AIRequest, AIResult, Agent, CIStatus, CIWatchOptions, CIWatchResult, CheckBucket, CheckResult,
    CommandOutput, Id, PipelineResult, StepDefinition, StepResult, StepStatus, StepType, Task,
    TaskConfig, Template, META_ARTIFACT_PATH, META_DETECT_ONLY, META_FAILURE_TYPE,
    META_PIPELINE_RESULT, META_PR_NUMBER, META_SCRATCHPAD_SETUP_ERROR, META_SKIP_GIT_STEPS,
    META_VALIDATION_CHECKS, META_VALIDATION_FAILED,
};

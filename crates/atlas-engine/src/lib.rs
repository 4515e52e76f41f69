//! atlas-engine - Task Step Engine
//!
//! Executors for every step type (AI, validation, CI, SDD, verify, loop),
//! the collaborator interfaces they consume, filesystem-backed artifact and
//! checkpoint stores, and a minimal template driver that closes the loop
//! step's recursion.

pub mod ai;
pub mod artifacts;
pub mod ci;
pub mod command;
pub mod driver;
pub mod executor;
pub mod interfaces;
pub mod loop_step;
pub mod scratchpad;
pub mod sdd;
pub mod state_store;
pub mod validation;
pub mod verify;

/// Type alias for application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

pub use ai::AIExecutor;
pub use artifacts::FsArtifactSaver;
pub use ci::{CIExecutor, CIFailureHandler};
pub use command::ShellRunner;
pub use driver::{Engine, EngineDeps, EngineError, TaskRunOutcome};
pub use executor::{DryRunExecutor, ExecutorRegistry, InnerStepRunner, StepError, StepExecutor};
pub use interfaces::{
    AIRunner, ArtifactSaver, CommandRunner, HubRunner, LoopStateStore, Notifier, RunnerError,
    StoreError, ToolChecker, ToolStatus,
};
pub use loop_step::LoopExecutor;
pub use scratchpad::Scratchpad;
pub use sdd::{SDDExecutor, SddCommand};
pub use state_store::FsLoopStateStore;
pub use validation::{ValidationCommands, ValidationExecutor, ValidationPipeline};
pub use verify::{IssueAction, IssueOutcome, VerifyExecutor};

//! Filesystem checkpoint store for loop state.
//!
//! Checkpoints live at `<root>/<workspace>/<task>/<step-name>.loopstate.json`.
//! A missing file is "no prior state"; a corrupt file surfaces as a load
//! error that the loop executor demotes to a fresh start.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use atlas_core::{LoopState, Task};

use crate::interfaces::{LoopStateStore, StoreError};

/// Loop state store rooted at the artifacts directory.
#[derive(Debug)]
pub struct FsLoopStateStore {
    root: PathBuf,
}

impl FsLoopStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn state_path(&self, task: &Task, step_name: &str) -> PathBuf {
        self.root
            .join(&task.workspace_id)
            .join(task.id.as_ref())
            .join(format!("{step_name}.loopstate.json"))
    }

    pub fn path_for(&self, task: &Task, step_name: &str) -> PathBuf {
        self.state_path(task, step_name)
    }
}

#[async_trait]
impl LoopStateStore for FsLoopStateStore {
    async fn save_loop_state(&self, task: &Task, state: &LoopState) -> Result<(), StoreError> {
        let path = self.state_path(task, &state.step_name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&path, bytes).await?;
        debug!(
            task_id = %task.id,
            step = state.step_name.as_str(),
            iteration = state.current_iteration,
            "loop state checkpointed"
        );
        Ok(())
    }

    async fn load_loop_state(
        &self,
        task: &Task,
        step_name: &str,
    ) -> Result<Option<LoopState>, StoreError> {
        let path = self.state_path(task, step_name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

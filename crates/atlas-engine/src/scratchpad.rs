//! Cross-iteration scratchpad: a JSON memory document in the artifact space.
//!
//! The loop executor owns the scratchpad exclusively for the duration of an
//! iteration, so plain read-modify-write is safe here.

use std::path::{Path, PathBuf};

use atlas_core::{IterationSummary, ScratchpadData};

use crate::interfaces::StoreError;

/// Handle to a scratchpad document at a concrete path.
#[derive(Debug, Clone)]
pub struct Scratchpad {
    path: PathBuf,
}

impl Scratchpad {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Overwrite the document, creating parent directories as needed.
    pub async fn write(&self, data: &ScratchpadData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(data)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    pub async fn read(&self) -> Result<ScratchpadData, StoreError> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Append one iteration summary via read-modify-write.
    pub async fn append_iteration(&self, summary: IterationSummary) -> Result<(), StoreError> {
        let mut data = self.read().await?;
        data.iterations.push(summary);
        self.write(&data).await
    }
}

//! Filesystem-backed artifact persistence.
//!
//! Layout: `<root>/<workspace>/<task>/<name>`, where `name` may contain
//! step-scoped subdirectories (`validate/validation.json`). Versioned saves
//! never clobber: `validation.json`, `validation.1.json`, `validation.2.json`
//! and so on, with the next free version chosen under a lock so concurrent
//! writers get distinct names.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::interfaces::{ArtifactSaver, StoreError};

/// Artifact saver rooted at a directory on the local filesystem.
#[derive(Debug)]
pub struct FsArtifactSaver {
    root: PathBuf,
    /// Serializes version-number selection for concurrent versioned saves.
    version_lock: Mutex<()>,
}

impl FsArtifactSaver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            version_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, workspace: &str, task: &str) -> PathBuf {
        self.root.join(workspace).join(task)
    }

    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        debug!(
            path = %path.display(),
            bytes = bytes.len(),
            checksum = %format!("{:x}", hasher.finalize()),
            "artifact written"
        );
        Ok(())
    }
}

/// Produce the candidate name for a version: `base.ext` for version 0,
/// `base.N.ext` afterwards. A base without an extension gets `base.N`.
fn versioned_name(base_name: &str, version: u32) -> String {
    if version == 0 {
        return base_name.to_string();
    }
    match base_name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.{version}.{ext}"),
        None => format!("{base_name}.{version}"),
    }
}

#[async_trait]
impl ArtifactSaver for FsArtifactSaver {
    async fn save_artifact(
        &self,
        workspace: &str,
        task: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError> {
        let path = self.task_dir(workspace, task).join(name);
        self.write_bytes(&path, bytes).await?;
        Ok(path.to_string_lossy().to_string())
    }

    async fn save_versioned_artifact(
        &self,
        workspace: &str,
        task: &str,
        base_name: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError> {
        let dir = self.task_dir(workspace, task);

        let _guard = self.version_lock.lock().await;
        let mut version = 0u32;
        let path = loop {
            let candidate = dir.join(versioned_name(base_name, version));
            if !candidate.exists() {
                break candidate;
            }
            version += 1;
        };
        self.write_bytes(&path, bytes).await?;
        drop(_guard);

        Ok(path.to_string_lossy().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn versioned_name_splits_extension() {
        assert_eq!(versioned_name("validation.json", 0), "validation.json");
        assert_eq!(versioned_name("validation.json", 1), "validation.1.json");
        assert_eq!(versioned_name("validation.json", 12), "validation.12.json");
        assert_eq!(versioned_name("notes", 2), "notes.2");
    }

    #[tokio::test]
    async fn save_artifact_creates_directories() {
        let dir = TempDir::new().unwrap();
        let saver = FsArtifactSaver::new(dir.path());
        let key = saver
            .save_artifact("ws", "task-1", "validate/validation.json", b"{}")
            .await
            .unwrap();
        assert!(key.ends_with("validation.json"));
        let written = dir.path().join("ws/task-1/validate/validation.json");
        assert_eq!(std::fs::read_to_string(written).unwrap(), "{}");
    }

    #[tokio::test]
    async fn versioned_saves_never_clobber() {
        let dir = TempDir::new().unwrap();
        let saver = FsArtifactSaver::new(dir.path());

        let first = saver
            .save_versioned_artifact("ws", "t", "validation.json", b"one")
            .await
            .unwrap();
        let second = saver
            .save_versioned_artifact("ws", "t", "validation.json", b"two")
            .await
            .unwrap();
        let third = saver
            .save_versioned_artifact("ws", "t", "validation.json", b"three")
            .await
            .unwrap();

        assert!(first.ends_with("validation.json"));
        assert!(second.ends_with("validation.1.json"));
        assert!(third.ends_with("validation.2.json"));
        assert_eq!(std::fs::read_to_string(first).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(third).unwrap(), "three");
    }

    #[tokio::test]
    async fn concurrent_versioned_saves_get_distinct_names() {
        let dir = TempDir::new().unwrap();
        let saver = Arc::new(FsArtifactSaver::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let saver = Arc::clone(&saver);
            handles.push(tokio::spawn(async move {
                saver
                    .save_versioned_artifact("ws", "t", "spec.md", format!("v{i}").as_bytes())
                    .await
                    .unwrap()
            }));
        }

        let mut names = Vec::new();
        for handle in handles {
            names.push(handle.await.unwrap());
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8, "every concurrent save must pick a distinct name");

        // Every payload must be retrievable.
        for name in &names {
            assert!(std::fs::read_to_string(name).unwrap().starts_with('v'));
        }
    }
}

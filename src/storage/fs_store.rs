//! Filesystem artifact store: write to a temp sibling, then rename into place.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{ArtifactKey, ArtifactStore};
use crate::core::errors::{FanoutError, Result};

const TEMP_PREFIX: &str = ".fanout-tmp-";

/// Artifact store rooted at a directory; keys are relative paths
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

/// Bytes written to a temp file that has not been committed yet
///
/// Dropping a staged artifact without committing it deletes the temp file.
#[derive(Debug)]
pub struct StagedArtifact {
    temp_path: Option<PathBuf>,
    target: PathBuf,
}

impl StagedArtifact {
    pub fn temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }

    /// Leave the temp file on disk, as a killed process would
    pub fn abandon(mut self) -> PathBuf {
        self.temp_path.take().unwrap_or_default()
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if let Some(path) = self.temp_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to discard staged artifact");
                }
            }
        }
    }
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `key` under the store root
    pub fn path_for(&self, key: &ArtifactKey) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in key.as_str().split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(FanoutError::internal(format!("invalid artifact key: {}", key)));
            }
            path.push(part);
        }
        Ok(path)
    }

    /// Write `bytes` to a uniquely named temp file next to the target
    pub async fn stage(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<StagedArtifact> {
        let target = self.path_for(key)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| FanoutError::storage(format!("create directory {}", parent.display()), e))?;

        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let temp_path = parent.join(format!("{}{}.{}", TEMP_PREFIX, file_name, cuid2::create_id()));

        // The guard owns the temp path from here on, so a failed or cancelled
        // write never leaves it behind.
        let staged = StagedArtifact {
            temp_path: Some(temp_path.clone()),
            target,
        };

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| FanoutError::storage(format!("create {}", temp_path.display()), e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| FanoutError::storage(format!("write {}", temp_path.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| FanoutError::storage(format!("sync {}", temp_path.display()), e))?;

        Ok(staged)
    }

    /// Promote a staged artifact to its final location
    pub async fn commit(&self, mut staged: StagedArtifact) -> Result<()> {
        let temp_path = staged
            .temp_path
            .clone()
            .ok_or_else(|| FanoutError::internal("staged artifact was abandoned"))?;
        tokio::fs::rename(&temp_path, &staged.target)
            .await
            .map_err(|e| {
                FanoutError::storage(
                    format!("commit {} -> {}", temp_path.display(), staged.target.display()),
                    e,
                )
            })?;
        staged.temp_path = None;
        debug!(target_path = %staged.target.display(), "Committed artifact");
        Ok(())
    }

    /// Remove temp files left behind by crashed writers; returns how many were deleted
    pub async fn sweep_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FanoutError::storage(format!("list {}", dir.display()), e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    tokio::fs::remove_file(entry.path()).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, root = %self.root.display(), "Swept stale temp files");
        }
        Ok(removed)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| FanoutError::storage(format!("stat {}", path.display()), e))
    }

    async fn write_atomic(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()> {
        let staged = self.stage(key, bytes).await?;
        self.commit(staged).await
    }

    async fn read(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FanoutError::storage(format!("read {}", path.display()), e)),
        }
    }

    async fn remove(&self, key: &ArtifactKey) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FanoutError::storage(format!("remove {}", path.display()), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let key = ArtifactKey::new("run/04-30-2020/worker_0/cases.json");

        assert!(!store.exists(&key).await.unwrap());
        store.write_atomic(&key, b"hello").await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.read(&key).await.unwrap().as_deref(), Some(&b"hello"[..]));

        // overwrite replaces the whole value
        store.write_atomic(&key, b"hi").await.unwrap();
        assert_eq!(store.read(&key).await.unwrap().as_deref(), Some(&b"hi"[..]));

        assert!(store.remove(&key).await.unwrap());
        assert!(!store.remove(&key).await.unwrap());
        assert_eq!(store.read(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_uncommitted_stage_is_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let key = ArtifactKey::new("a/b.json");

        let staged = store.stage(&key, b"partial").await.unwrap();
        let temp = staged.temp_path().unwrap().to_path_buf();
        assert!(temp.exists());
        assert!(!store.exists(&key).await.unwrap());

        drop(staged);
        assert!(!temp.exists());
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_removes_abandoned_temps() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let key = ArtifactKey::new("a/b.json");

        let leftover = store.stage(&key, b"partial").await.unwrap().abandon();
        assert!(leftover.exists());
        store.write_atomic(&ArtifactKey::new("a/c.json"), b"ok").await.unwrap();

        assert_eq!(store.sweep_temp_files().await.unwrap(), 1);
        assert!(!leftover.exists());
        assert!(store.exists(&ArtifactKey::new("a/c.json")).await.unwrap());
    }

    #[tokio::test]
    async fn test_io_faults_are_not_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.write_atomic(&ArtifactKey::new("a/b.json"), b"ok").await.unwrap();

        // a regular file used as a directory is a storage fault, not a missing key
        let nested = ArtifactKey::new("a/b.json/c.json");
        assert!(matches!(store.exists(&nested).await, Err(FanoutError::Storage { .. })));
        assert!(matches!(store.read(&nested).await, Err(FanoutError::Storage { .. })));
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let store = FsArtifactStore::new("/tmp/root");
        assert!(store.path_for(&ArtifactKey::new("../etc/passwd")).is_err());
        assert!(store.path_for(&ArtifactKey::new("a//b")).is_err());
        assert_eq!(
            store.path_for(&ArtifactKey::new("a/b.json")).unwrap(),
            PathBuf::from("/tmp/root/a/b.json")
        );
    }
}

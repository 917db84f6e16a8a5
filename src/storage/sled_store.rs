use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

use super::{ArtifactKey, ArtifactStore};
use crate::core::errors::{FanoutError, Result};

const ARTIFACT_TREE: &str = "artifacts";
const COMPRESSION_LEVEL: i32 = 3;

/// Artifact store backed by an embedded sled database
///
/// Values are zstd-compressed. A single-key insert is atomic in sled, which
/// gives the same all-or-nothing visibility as a rename on a filesystem.
#[derive(Clone)]
pub struct SledArtifactStore {
    tree: sled::Tree,
}

impl std::fmt::Debug for SledArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledArtifactStore")
            .field("entries", &self.tree.len())
            .finish()
    }
}

impl SledArtifactStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(&db)
    }

    /// Use the artifact tree of an already opened database
    pub fn from_db(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree(ARTIFACT_TREE)?;
        Ok(Self { tree })
    }

    /// Throwaway database removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db)
    }
}

#[async_trait]
impl ArtifactStore for SledArtifactStore {
    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        Ok(self.tree.contains_key(key.as_str().as_bytes())?)
    }

    async fn write_atomic(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()> {
        let compressed = zstd::encode_all(bytes, COMPRESSION_LEVEL)
            .map_err(|e| FanoutError::storage(format!("compress {}", key), e))?;
        self.tree.insert(key.as_str().as_bytes(), compressed)?;
        self.tree.flush_async().await?;
        debug!(key = %key, size = bytes.len(), "Stored artifact");
        Ok(())
    }

    async fn read(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>> {
        match self.tree.get(key.as_str().as_bytes())? {
            Some(compressed) => {
                let bytes = zstd::decode_all(&compressed[..])
                    .map_err(|e| FanoutError::corrupt(key.as_str(), format!("decompression failed: {}", e)))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &ArtifactKey) -> Result<bool> {
        Ok(self.tree.remove(key.as_str().as_bytes())?.is_some())
    }
}

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{ArtifactKey, ArtifactStore};
use crate::core::errors::Result;

/// In-process artifact store
///
/// Clones share the same map. A single `insert` replaces the whole value, so
/// readers only ever see complete artifacts.
#[derive(Debug, Clone, Default)]
pub struct MemoryArtifactStore {
    entries: Arc<DashMap<ArtifactKey, Vec<u8>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of successful `write_atomic` calls since creation
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Sorted list of stored keys
    pub fn keys(&self) -> Vec<ArtifactKey> {
        let mut keys: Vec<ArtifactKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Put raw bytes without counting a write, e.g. to plant a corrupt artifact
    pub fn insert_raw(&self, key: ArtifactKey, bytes: Vec<u8>) {
        self.entries.insert(key, bytes);
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn write_atomic(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()> {
        self.entries.insert(key.clone(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn remove(&self, key: &ArtifactKey) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

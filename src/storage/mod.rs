//! Storage layer
//!
//! Two kinds of persistence back a run:
//! - artifact stores hold unit outputs under deterministic keys and only ever
//!   expose fully written values;
//! - run state stores hold small named values (the fan-out plan) scoped to a
//!   run identity.

pub mod fs_store;
pub mod layout;
pub mod memory_store;
pub mod run_state;
pub mod sled_store;

pub use fs_store::{FsArtifactStore, StagedArtifact};
pub use layout::ArtifactLayout;
pub use memory_store::MemoryArtifactStore;
pub use run_state::{MemoryRunState, RunStateStore, SledRunState};
pub use sled_store::SledArtifactStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::errors::Result;

/// Deterministic location of an artifact, a `/`-separated relative path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component without extension, e.g. `todo_3`
    pub fn stem(&self) -> &str {
        let name = self.0.rsplit('/').next().unwrap_or(&self.0);
        match name.rfind('.') {
            Some(dot) if dot > 0 => &name[..dot],
            _ => name,
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pluggable artifact storage
///
/// Implementations guarantee that `read` never observes a partially written
/// value: `write_atomic` either makes the complete bytes visible or nothing.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Whether a committed value exists at `key`
    async fn exists(&self, key: &ArtifactKey) -> Result<bool>;

    /// Replace the value at `key` with `bytes` in a single visible step
    async fn write_atomic(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()>;

    /// Read the committed value at `key`
    async fn read(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>>;

    /// Delete the value at `key`; returns whether something was removed
    async fn remove(&self, key: &ArtifactKey) -> Result<bool>;
}

//! Run-scoped named values with compare-and-swap updates.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

use crate::core::errors::Result;
use crate::model::RunId;

const STATE_TREE: &str = "run_state";

/// Result of a compare-and-swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// The stored value did not match the expected one; carries what is stored
    Conflict { current: Option<Vec<u8>> },
}

/// Small named values keyed by run identity (e.g. the fan-out plan)
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn get(&self, run: &RunId, name: &str) -> Result<Option<Vec<u8>>>;

    /// Replace `expected` with `new` atomically. `None` means absent on
    /// either side.
    async fn compare_and_swap(
        &self,
        run: &RunId,
        name: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<CasOutcome>;
}

fn state_key(run: &RunId, name: &str) -> String {
    format!("{}::{}", run.path_prefix(), name)
}

/// In-process run state, shared between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryRunState {
    values: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryRunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every value stored for `run`
    pub fn clear_run(&self, run: &RunId) {
        let prefix = format!("{}::", run.path_prefix());
        self.values.retain(|k, _| !k.starts_with(&prefix));
    }
}

#[async_trait]
impl RunStateStore for MemoryRunState {
    async fn get(&self, run: &RunId, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.get(&state_key(run, name)).map(|v| v.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        run: &RunId,
        name: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<CasOutcome> {
        // The entry holds the shard lock for the whole check-and-set.
        let outcome = match self.values.entry(state_key(run, name)) {
            Entry::Occupied(mut entry) => {
                if expected == Some(entry.get().as_slice()) {
                    match new {
                        Some(value) => {
                            entry.insert(value.to_vec());
                        }
                        None => {
                            entry.remove();
                        }
                    }
                    CasOutcome::Swapped
                } else {
                    CasOutcome::Conflict {
                        current: Some(entry.get().clone()),
                    }
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    if let Some(value) = new {
                        entry.insert(value.to_vec());
                    }
                    CasOutcome::Swapped
                } else {
                    CasOutcome::Conflict { current: None }
                }
            }
        };
        Ok(outcome)
    }
}

/// Run state persisted in a sled tree, using sled's native CAS
#[derive(Clone)]
pub struct SledRunState {
    tree: sled::Tree,
}

impl std::fmt::Debug for SledRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledRunState").finish_non_exhaustive()
    }
}

impl SledRunState {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(&db)
    }

    pub fn from_db(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(STATE_TREE)?,
        })
    }

    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db)
    }
}

#[async_trait]
impl RunStateStore for SledRunState {
    async fn get(&self, run: &RunId, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(state_key(run, name))?.map(|v| v.to_vec()))
    }

    async fn compare_and_swap(
        &self,
        run: &RunId,
        name: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<CasOutcome> {
        let outcome = match self.tree.compare_and_swap(state_key(run, name), expected, new)? {
            Ok(()) => {
                self.tree.flush_async().await?;
                CasOutcome::Swapped
            }
            Err(conflict) => CasOutcome::Conflict {
                current: conflict.current.map(|v| v.to_vec()),
            },
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn run(day: u32) -> RunId {
        RunId::new("jail_scraper", NaiveDate::from_ymd_opt(2020, 4, day).unwrap())
    }

    async fn exercise(store: &dyn RunStateStore) {
        let r = run(30);
        assert_eq!(store.get(&r, "num_tasks").await.unwrap(), None);

        let swapped = store.compare_and_swap(&r, "num_tasks", None, Some(&b"3"[..])).await.unwrap();
        assert_eq!(swapped, CasOutcome::Swapped);

        // a second writer expecting absence loses
        let lost = store.compare_and_swap(&r, "num_tasks", None, Some(&b"4"[..])).await.unwrap();
        assert_eq!(lost, CasOutcome::Conflict { current: Some(b"3".to_vec()) });

        let swapped = store
            .compare_and_swap(&r, "num_tasks", Some(&b"3"[..]), Some(&b"4"[..]))
            .await
            .unwrap();
        assert_eq!(swapped, CasOutcome::Swapped);
        assert_eq!(store.get(&r, "num_tasks").await.unwrap(), Some(b"4".to_vec()));

        // other runs are isolated
        assert_eq!(store.get(&run(29), "num_tasks").await.unwrap(), None);

        let removed = store.compare_and_swap(&r, "num_tasks", Some(&b"4"[..]), None).await.unwrap();
        assert_eq!(removed, CasOutcome::Swapped);
        assert_eq!(store.get(&r, "num_tasks").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_cas() {
        exercise(&MemoryRunState::new()).await;
    }

    #[tokio::test]
    async fn test_sled_cas() {
        exercise(&SledRunState::temporary().unwrap()).await;
    }

    #[tokio::test]
    async fn test_clear_run() {
        let store = MemoryRunState::new();
        store.compare_and_swap(&run(30), "a", None, Some(&b"1"[..])).await.unwrap();
        store.compare_and_swap(&run(29), "a", None, Some(&b"1"[..])).await.unwrap();
        store.clear_run(&run(30));
        assert_eq!(store.get(&run(30), "a").await.unwrap(), None);
        assert!(store.get(&run(29), "a").await.unwrap().is_some());
    }
}

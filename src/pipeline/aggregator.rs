use futures::future::join_all;
use tracing::info;

use super::interfaces::ResultSink;
use crate::core::errors::{FanoutError, Result};
use crate::model::{CaseRecord, RunId};
use crate::storage::{ArtifactLayout, ArtifactStore};
use crate::unit::{envelope, RunSalts};

/// Fan-in over the worker artifacts of one run
///
/// Locations come from the task count and the index convention only; the
/// store is never listed.
pub struct Aggregator<'a> {
    store: &'a dyn ArtifactStore,
    layout: &'a ArtifactLayout,
    salts: &'a RunSalts,
}

impl<'a> Aggregator<'a> {
    pub fn new(store: &'a dyn ArtifactStore, layout: &'a ArtifactLayout, salts: &'a RunSalts) -> Self {
        Self { store, layout, salts }
    }

    /// Concatenate the case records of workers `0..task_count` in index order
    ///
    /// Any absent artifact fails with [`FanoutError::MissingArtifact`]; a
    /// malformed one with [`FanoutError::CorruptArtifact`].
    pub async fn collect(&self, task_count: usize) -> Result<Vec<CaseRecord>> {
        let keys = self.layout.worker_keys(task_count, self.salts);
        // Reads overlap; results are checked in index order so the lowest
        // missing index is the one reported.
        let reads = join_all(keys.iter().map(|key| self.store.read(key))).await;

        let mut combined = Vec::new();
        for (index, (key, read)) in keys.iter().zip(reads).enumerate() {
            let bytes = read?.ok_or(FanoutError::MissingArtifact { index })?;
            let records: Vec<CaseRecord> = envelope::decode(key, &bytes)?;
            combined.extend(records);
        }
        Ok(combined)
    }

    /// Collect and hand the combined records to `sink`; returns how many were delivered
    pub async fn consume(&self, run: &RunId, task_count: usize, sink: &dyn ResultSink) -> Result<usize> {
        let combined = self.collect(task_count).await?;
        let count = combined.len();
        sink.deliver(run, combined).await?;
        info!(run = %run, workers = task_count, records = count, "Delivered aggregated results");
        Ok(count)
    }
}

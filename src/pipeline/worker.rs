//! Worker unit: query the remote service for every record of one chunk.

use std::sync::Arc;
use tracing::{debug, instrument};

use super::credentials::Credentials;
use super::interfaces::{QueryClient, QuerySession};
use super::session::SessionGuard;
use crate::core::config::RecordFields;
use crate::core::errors::{FanoutError, Result};
use crate::graph::TaskKind;
use crate::model::{CaseRecord, Chunk, Subject};
use crate::storage::{ArtifactLayout, ArtifactStore};
use crate::unit::{envelope, IdempotentUnit, RunSalts, UnitRun};

/// Query every record of `chunk` and flatten the returned case groups
///
/// Output order follows record order, then group order, then row order.
pub async fn process_chunk(
    session: &mut dyn QuerySession,
    chunk: &Chunk,
    fields: RecordFields,
    unit: &str,
) -> Result<Vec<CaseRecord>> {
    let mut cases = Vec::new();
    for (position, record) in chunk.records.iter().enumerate() {
        let subject = Subject::from_record(record, fields, position)?;
        let groups = session
            .query(subject.name, subject.date_of_birth)
            .await
            .map_err(|e| e.into_unit_failure(unit))?;
        for group in groups {
            cases.extend(group);
        }
    }
    debug!(unit, records = chunk.len(), cases = cases.len(), "Processed chunk");
    Ok(cases)
}

/// Everything a worker needs, cheap to clone into a spawned task
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn ArtifactStore>,
    pub client: Arc<dyn QueryClient>,
    pub credentials: Credentials,
    pub layout: ArtifactLayout,
    pub salts: RunSalts,
    pub fields: RecordFields,
}

impl WorkerContext {
    /// Read the chunk written by the partition unit for `index`
    pub async fn load_chunk(&self, index: usize) -> Result<Chunk> {
        let key = self.layout.chunk_key(index, self.salts.partition.as_ref());
        let bytes = self
            .store
            .read(&key)
            .await?
            .ok_or_else(|| FanoutError::corrupt(key.as_str(), "chunk artifact missing"))?;
        let chunk: Chunk = envelope::decode(&key, &bytes)?;
        if chunk.index != index {
            return Err(FanoutError::corrupt(
                key.as_str(),
                format!("holds chunk {} instead of {}", chunk.index, index),
            ));
        }
        Ok(chunk)
    }

    /// Run worker `index` as an idempotent unit
    #[instrument(skip(self), fields(run = %self.layout.run()))]
    pub async fn run(&self, index: usize) -> Result<UnitRun<Vec<CaseRecord>>> {
        let name = TaskKind::Worker(index).node_id();
        let key = self.layout.worker_key(index, self.salts.worker(index).as_ref());
        let unit = IdempotentUnit::new(name.clone(), key, self.store.as_ref());

        let ctx = self;
        let unit_name = name.as_str();
        unit.run(move || async move {
            let chunk = ctx.load_chunk(index).await?;
            let session = ctx
                .client
                .open_session(&ctx.credentials)
                .await
                .map_err(|e| e.into_unit_failure(unit_name))?;
            let mut guard = SessionGuard::new(unit_name, session);

            let result = match guard.session() {
                Some(session) => process_chunk(session, &chunk, ctx.fields, unit_name).await,
                None => Err(FanoutError::internal("query session closed before use")),
            };
            guard.close().await;
            result
        })
        .await
    }
}

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, info, warn};

use super::envelope;
use crate::core::errors::{FanoutError, Result};
use crate::storage::{ArtifactKey, ArtifactStore};

/// How a unit invocation produced its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOutcome {
    /// The wrapped operation ran and its result was committed
    Executed,
    /// A valid artifact already existed; the operation was not invoked
    Skipped,
}

/// Value returned by an idempotent unit together with how it was obtained
#[derive(Debug, Clone, PartialEq)]
pub struct UnitRun<T> {
    pub value: T,
    pub outcome: UnitOutcome,
}

/// One side-effecting operation whose result lives at a fixed artifact key
///
/// The key is derived from the run and unit identity by the caller, never from
/// the clock. Invoking the unit again after a successful commit reuses the
/// artifact; invoking it after a failure or a crash re-runs the operation and
/// converges on the same artifact.
pub struct IdempotentUnit<'a> {
    name: String,
    key: ArtifactKey,
    store: &'a dyn ArtifactStore,
}

impl<'a> IdempotentUnit<'a> {
    pub fn new(name: impl Into<String>, key: ArtifactKey, store: &'a dyn ArtifactStore) -> Self {
        Self {
            name: name.into(),
            key,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }

    /// The committed value, if one exists and passes its completion checks
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let Some(bytes) = self.store.read(&self.key).await? else {
            return Ok(None);
        };
        match envelope::decode(&self.key, &bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(unit = %self.name, key = %self.key, error = %e, "Ignoring malformed artifact");
                Ok(None)
            }
        }
    }

    /// Return the committed value or run `f` and commit its result
    pub async fn run<T, F, Fut>(&self, f: F) -> Result<UnitRun<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.load().await? {
            debug!(unit = %self.name, key = %self.key, "Artifact present, skipping");
            return Ok(UnitRun {
                value,
                outcome: UnitOutcome::Skipped,
            });
        }

        let value = f().await.map_err(|e| self.failed(e))?;
        let bytes = envelope::encode(&self.key, &value)?;
        self.store
            .write_atomic(&self.key, &bytes)
            .await
            .map_err(|e| self.failed(e))?;

        info!(unit = %self.name, key = %self.key, size = bytes.len(), "Committed artifact");
        Ok(UnitRun {
            value,
            outcome: UnitOutcome::Executed,
        })
    }

    fn failed(&self, err: FanoutError) -> FanoutError {
        match err {
            FanoutError::UnitFailed { .. } | FanoutError::Cancelled | FanoutError::PlanDrift { .. } => err,
            other => FanoutError::unit_failed(self.name.clone(), other.failure_kind(), other),
        }
    }
}

/// Run `f` at most once per committed artifact at `key`
pub async fn execute_idempotent<T, F, Fut>(store: &dyn ArtifactStore, key: &ArtifactKey, f: F) -> Result<UnitRun<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    IdempotentUnit::new(key.stem(), key.clone(), store).run(f).await
}

//! Fan-out width: computed from the chunks, persisted per run, sealed once
//! workers exist.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::errors::{FanoutError, Result};
use crate::model::{Chunk, RunId};
use crate::storage::run_state::{CasOutcome, RunStateStore};
use crate::unit::salt::Salt;

/// Name of the persisted task count in run state
pub const TASK_COUNT_KEY: &str = "num_tasks";

/// State name of the plan for one partition generation
///
/// Salted partitions get their own plan, so a new generation may choose a
/// different width while a retry of the same generation keeps its count.
pub fn plan_key(partition: Option<&Salt>) -> String {
    match partition {
        Some(salt) => format!("{}-{}", TASK_COUNT_KEY, salt.short()),
        None => TASK_COUNT_KEY.to_string(),
    }
}

const MAX_CAS_ATTEMPTS: usize = 16;

/// Persisted fan-out decision of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub task_count: usize,
    pub capacity: usize,
    /// Set once worker tasks have been instantiated; the count is frozen after
    pub sealed: bool,
}

impl PlanRecord {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Clone)]
pub struct FanoutPlanner {
    state: Arc<dyn RunStateStore>,
}

impl FanoutPlanner {
    pub fn new(state: Arc<dyn RunStateStore>) -> Self {
        Self { state }
    }

    /// Number of worker tasks needed for `chunks`
    pub fn plan(chunks: &[Chunk]) -> usize {
        chunks.len()
    }

    pub async fn load(&self, run: &RunId, partition: Option<&Salt>) -> Result<Option<PlanRecord>> {
        match self.state.get(run, &plan_key(partition)).await? {
            Some(bytes) => Ok(Some(PlanRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The persisted task count, or `default` when the run has none yet
    pub async fn task_count(&self, run: &RunId, partition: Option<&Salt>, default: usize) -> Result<usize> {
        Ok(self
            .load(run, partition)
            .await?
            .map(|p| p.task_count)
            .unwrap_or(default))
    }

    /// Record `task_count` for `run`
    ///
    /// Persisting the same count again is a no-op. A different count replaces
    /// an unsealed plan, and fails with [`FanoutError::PlanDrift`] once the
    /// plan is sealed.
    pub async fn persist(
        &self,
        run: &RunId,
        partition: Option<&Salt>,
        task_count: usize,
        capacity: usize,
    ) -> Result<PlanRecord> {
        let name = plan_key(partition);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.state.get(run, &name).await?;
            let existing = current.as_deref().map(PlanRecord::decode).transpose()?;

            let proposed = match existing {
                Some(plan) if plan.task_count == task_count => {
                    debug!(run = %run, count = task_count, "Plan already persisted");
                    return Ok(plan);
                }
                Some(plan) if plan.sealed => {
                    return Err(FanoutError::PlanDrift {
                        run: run.to_string(),
                        persisted: plan.task_count,
                        computed: task_count,
                    });
                }
                Some(plan) => {
                    warn!(
                        run = %run,
                        persisted = plan.task_count,
                        computed = task_count,
                        "Replacing unsealed plan"
                    );
                    PlanRecord {
                        task_count,
                        capacity,
                        sealed: false,
                    }
                }
                None => PlanRecord {
                    task_count,
                    capacity,
                    sealed: false,
                },
            };

            let encoded = proposed.encode()?;
            match self
                .state
                .compare_and_swap(run, &name, current.as_deref(), Some(encoded.as_slice()))
                .await?
            {
                CasOutcome::Swapped => {
                    info!(run = %run, count = task_count, capacity, "Persisted fan-out plan");
                    return Ok(proposed);
                }
                CasOutcome::Conflict { .. } => continue,
            }
        }
        Err(FanoutError::internal(format!(
            "could not persist plan for {} after {} attempts",
            run, MAX_CAS_ATTEMPTS
        )))
    }

    /// Freeze the persisted plan before worker tasks are instantiated
    pub async fn seal(&self, run: &RunId, partition: Option<&Salt>) -> Result<PlanRecord> {
        let name = plan_key(partition);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.state.get(run, &name).await? else {
                return Err(FanoutError::internal(format!("no plan persisted for {}", run)));
            };
            let plan = PlanRecord::decode(&current)?;
            if plan.sealed {
                return Ok(plan);
            }

            let sealed = PlanRecord { sealed: true, ..plan };
            let encoded = sealed.encode()?;
            if let CasOutcome::Swapped = self
                .state
                .compare_and_swap(run, &name, Some(current.as_slice()), Some(encoded.as_slice()))
                .await?
            {
                debug!(run = %run, count = sealed.task_count, "Sealed fan-out plan");
                return Ok(sealed);
            }
        }
        Err(FanoutError::internal(format!(
            "could not seal plan for {} after {} attempts",
            run, MAX_CAS_ATTEMPTS
        )))
    }

    /// Remove the plan of `run`; the next partition starts from scratch
    pub async fn discard(&self, run: &RunId, partition: Option<&Salt>) -> Result<bool> {
        let name = plan_key(partition);
        let Some(current) = self.state.get(run, &name).await? else {
            return Ok(false);
        };
        let outcome = self
            .state
            .compare_and_swap(run, &name, Some(current.as_slice()), None)
            .await?;
        if outcome == CasOutcome::Swapped {
            warn!(run = %run, "Discarded fan-out plan");
        }
        Ok(outcome == CasOutcome::Swapped)
    }
}

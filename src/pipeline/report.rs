use serde::{Deserialize, Serialize};

use crate::core::errors::FailureKind;
use crate::graph::TaskKind;
use crate::model::RunId;
use crate::partition::PlanRecord;
use crate::unit::UnitOutcome;

/// Final state of one unit in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Executed,
    Skipped,
    Failed { kind: FailureKind, cause: String },
    /// Aborted by a cancel signal before it finished
    Cancelled,
}

impl From<UnitOutcome> for UnitStatus {
    fn from(outcome: UnitOutcome) -> Self {
        match outcome {
            UnitOutcome::Executed => UnitStatus::Executed,
            UnitOutcome::Skipped => UnitStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: TaskKind,
    pub status: UnitStatus,
    /// Invocations made in this run; 0 when not reached or the task was lost
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Every worker committed and the consumer delivered
    Completed,
    /// Some workers failed; the consumer did not run
    Blocked { failed: Vec<usize> },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run: RunId,
    /// Unique per invocation, for correlating logs of retried runs
    pub attempt_id: String,
    pub plan: PlanRecord,
    pub units: Vec<UnitReport>,
    pub status: RunStatus,
    /// Records handed to the sink, when the consumer ran
    pub records: Option<usize>,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn unit(&self, kind: TaskKind) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.unit == kind)
    }

    fn workers_with(&self, pred: impl Fn(&UnitStatus) -> bool) -> Vec<usize> {
        self.units
            .iter()
            .filter_map(|u| match u.unit {
                TaskKind::Worker(index) if pred(&u.status) => Some(index),
                _ => None,
            })
            .collect()
    }

    pub fn executed_workers(&self) -> Vec<usize> {
        self.workers_with(|s| *s == UnitStatus::Executed)
    }

    pub fn skipped_workers(&self) -> Vec<usize> {
        self.workers_with(|s| *s == UnitStatus::Skipped)
    }

    pub fn failed_workers(&self) -> Vec<usize> {
        self.workers_with(|s| matches!(s, UnitStatus::Failed { .. }))
    }

    pub fn cancelled_workers(&self) -> Vec<usize> {
        self.workers_with(|s| *s == UnitStatus::Cancelled)
    }
}

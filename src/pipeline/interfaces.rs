//! Narrow interfaces to the systems a run talks to.
//!
//! The engine never knows how records are collected, how the remote service
//! is queried or where aggregated results go; it only calls these traits.

use async_trait::async_trait;
use thiserror::Error;

use super::credentials::Credentials;
use crate::core::errors::{FailureKind, FanoutError};
use crate::model::{CaseGroup, CaseRecord, RecordBatch, RunId};

/// Upstream collector producing the batch of a run
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn collect(&self, run: &RunId) -> anyhow::Result<RecordBatch>;
}

/// Downstream destination of the aggregated results
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, run: &RunId, records: Vec<CaseRecord>) -> anyhow::Result<()>;
}

/// Failure reported by the remote query service
#[derive(Debug, Error)]
pub enum QueryError {
    /// Worth retrying: network blips, throttling, session expiry
    #[error("transient query failure: {0}")]
    Transient(String),
    /// Retrying will not help: bad credentials, rejected input
    #[error("permanent query failure: {0}")]
    Permanent(String),
}

impl QueryError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::Transient,
            Self::Permanent(_) => FailureKind::Permanent,
        }
    }

    /// Attribute this failure to `unit`
    pub fn into_unit_failure(self, unit: &str) -> FanoutError {
        FanoutError::unit_failed(unit, self.kind(), self)
    }
}

/// One authenticated conversation with the query service
///
/// A session belongs to exactly one worker and is closed when that worker
/// finishes, whatever the outcome.
#[async_trait]
pub trait QuerySession: Send {
    /// Cases recorded for the person identified by `name` and `date_of_birth`
    async fn query(&mut self, name: &str, date_of_birth: &str) -> Result<Vec<CaseGroup>, QueryError>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Factory of query sessions
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn open_session(&self, credentials: &Credentials) -> Result<Box<dyn QuerySession>, QueryError>;
}

use std::fmt;
use thiserror::Error;

/// Whether a failed unit may be retried on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Retry-eligible at unit granularity (network blips, timeouts)
    Transient,
    /// Aborts the unit; surfaced to the run owner
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Unified error type for the fan-out engine
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Invalid configuration (bad capacity, empty names, ...). Fatal, never retried.
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// The fan-out width changed after workers were instantiated for the run
    #[error("Plan drift for run {run}: persisted task count {persisted}, computed {computed}")]
    PlanDrift {
        run: String,
        persisted: usize,
        computed: usize,
    },

    /// A unit of work failed
    #[error("Unit {unit} failed ({kind}): {cause}")]
    UnitFailed {
        unit: String,
        kind: FailureKind,
        cause: String,
    },

    /// A worker the runner believed complete never committed its artifact
    #[error("Missing artifact for worker {index}")]
    MissingArtifact { index: usize },

    /// An artifact exists but fails its completion-marker checks
    #[error("Corrupt artifact {key}: {reason}")]
    CorruptArtifact { key: String, reason: String },

    /// A record lacks the fields the worker needs
    #[error("Invalid record {position}: {reason}")]
    InvalidRecord { position: usize, reason: String },

    /// Graph construction or validation failed
    #[error("Invalid task graph: {0}")]
    InvalidGraph(String),

    /// Artifact or state backend failure
    #[error("Storage operation failed: {operation}")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State database error: {0}")]
    State(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FanoutError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a specific field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a unit failure
    pub fn unit_failed<U: Into<String>, C: fmt::Display>(unit: U, kind: FailureKind, cause: C) -> Self {
        Self::UnitFailed {
            unit: unit.into(),
            kind,
            cause: cause.to_string(),
        }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a corrupt artifact error
    pub fn corrupt<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        Self::CorruptArtifact {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Check if the error may go away when the same unit is run again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnitFailed { kind, .. } => *kind == FailureKind::Transient,
            Self::Io(_) | Self::Storage { .. } | Self::State(_) => true,
            Self::Configuration { .. }
            | Self::PlanDrift { .. }
            | Self::MissingArtifact { .. }
            | Self::InvalidRecord { .. }
            | Self::InvalidGraph(_)
            | Self::Cancelled => false,
            _ => false,
        }
    }

    /// Failure kind as seen by the unit that produced this error
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::UnitFailed { kind, .. } => *kind,
            _ if self.is_retryable() => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }

    /// Get error category for structured logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::PlanDrift { .. } => "plan_drift",
            Self::UnitFailed { .. } => "unit",
            Self::MissingArtifact { .. } => "missing_artifact",
            Self::CorruptArtifact { .. } => "corrupt_artifact",
            Self::InvalidRecord { .. } => "record",
            Self::InvalidGraph(_) => "graph",
            Self::Storage { .. } => "storage",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::State(_) => "state",
            Self::Encoding(_) => "encoding",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FanoutError>;

impl From<anyhow::Error> for FanoutError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<FanoutError>() {
            Ok(inner) => inner,
            Err(other) => Self::Internal(format!("{:#}", other)),
        }
    }
}

impl From<tokio::task::JoinError> for FanoutError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Internal(format!("worker task panicked: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let transient = FanoutError::unit_failed("worker_0", FailureKind::Transient, "reset by peer");
        assert!(transient.is_retryable());

        let permanent = FanoutError::unit_failed("worker_0", FailureKind::Permanent, "no such person");
        assert!(!permanent.is_retryable());

        let drift = FanoutError::PlanDrift {
            run: "jail_scraper/04-30-2020".to_string(),
            persisted: 3,
            computed: 4,
        };
        assert!(!drift.is_retryable());
        assert_eq!(drift.failure_kind(), FailureKind::Permanent);

        assert!(!FanoutError::configuration("capacity must be >= 1").is_retryable());
        assert!(!FanoutError::MissingArtifact { index: 3 }.is_retryable());

        let io = FanoutError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.failure_kind(), FailureKind::Transient);
    }

    #[test]
    fn test_error_display() {
        let err = FanoutError::MissingArtifact { index: 3 };
        assert_eq!(err.to_string(), "Missing artifact for worker 3");

        let err = FanoutError::unit_failed("worker_2", FailureKind::Transient, "timeout");
        let display = err.to_string();
        assert!(display.contains("worker_2"));
        assert!(display.contains("transient"));
        assert!(display.contains("timeout"));
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_variant() {
        let wrapped: anyhow::Error = FanoutError::MissingArtifact { index: 1 }.into();
        match FanoutError::from(wrapped) {
            FanoutError::MissingArtifact { index } => assert_eq!(index, 1),
            other => panic!("unexpected error: {other}"),
        }
    }
}

// Core infrastructure shared by every stage of a pipeline run

pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use config::{PipelineConfig, PipelineConfigBuilder, RecordFields, RetryStrategy, UnitVersions};
pub use errors::{FailureKind, FanoutError, Result};
pub use logging::{init_tracing, LogFormat};

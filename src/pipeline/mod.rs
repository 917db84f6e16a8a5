// Orchestration of a fan-out run and its collaborators

pub mod aggregator;
pub mod credentials;
pub mod events;
pub mod interfaces;
pub mod report;
pub mod runner;
pub mod session;
pub mod worker;

pub use aggregator::Aggregator;
pub use credentials::Credentials;
pub use events::{EventBus, RunEvent};
pub use interfaces::{QueryClient, QueryError, QuerySession, RecordSource, ResultSink};
pub use report::{RunReport, RunStatus, UnitReport, UnitStatus};
pub use runner::{PartitionManifest, PipelineRunner, PipelineRunnerBuilder};
pub use session::SessionGuard;
pub use worker::{process_chunk, WorkerContext};

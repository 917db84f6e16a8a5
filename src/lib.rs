// Core infrastructure modules
pub mod core;
pub mod model;

// Engine building blocks, leaf first
pub mod storage;    // Artifact stores and run state
pub mod unit;       // Idempotent, atomically committed units
pub mod partition;  // Chunking and fan-out planning
pub mod graph;      // Plan-then-build task graph
pub mod pipeline;   // Runner, workers, aggregation

// Re-exports for convenience
pub use crate::core::errors::{FailureKind, FanoutError, Result};
pub use crate::core::{init_tracing, LogFormat, PipelineConfig, RetryStrategy};
pub use graph::{TaskGraph, TaskKind};
pub use model::{CaseGroup, CaseRecord, Chunk, Record, RecordBatch, RunId};
pub use partition::{split, split_batch, FanoutPlanner, HeaderPolicy, PlanRecord};
pub use pipeline::{
    Credentials, PipelineRunner, QueryClient, QueryError, QuerySession, RecordSource, ResultSink,
    RunEvent, RunReport, RunStatus,
};
pub use storage::{
    ArtifactKey, ArtifactLayout, ArtifactStore, FsArtifactStore, MemoryArtifactStore, MemoryRunState,
    RunStateStore, SledArtifactStore, SledRunState,
};
pub use unit::{execute_idempotent, IdempotentUnit, UnitOutcome, UnitRun};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::{Arc, Mutex};

    struct FixedSource(RecordBatch);

    #[async_trait]
    impl RecordSource for FixedSource {
        async fn collect(&self, _run: &RunId) -> anyhow::Result<RecordBatch> {
            Ok(self.0.clone())
        }
    }

    struct EchoSession;

    #[async_trait]
    impl QuerySession for EchoSession {
        async fn query(&mut self, name: &str, date_of_birth: &str) -> std::result::Result<Vec<CaseGroup>, QueryError> {
            Ok(vec![vec![vec![name.to_string(), date_of_birth.to_string()]]])
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct EchoClient;

    #[async_trait]
    impl QueryClient for EchoClient {
        async fn open_session(&self, _credentials: &Credentials) -> std::result::Result<Box<dyn QuerySession>, QueryError> {
            Ok(Box::new(EchoSession))
        }
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<CaseRecord>>);

    #[async_trait]
    impl ResultSink for CollectingSink {
        async fn deliver(&self, _run: &RunId, records: Vec<CaseRecord>) -> anyhow::Result<()> {
            self.0.lock().unwrap().extend(records);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_pipeline_in_memory() {
        let batch: RecordBatch = (0..5)
            .map(|i| Record::new([i.to_string(), format!("person {i}"), "01/01/1970".to_string()]))
            .collect();
        let sink = Arc::new(CollectingSink::default());
        let config = PipelineConfig::builder().capacity(2).build().unwrap();

        let runner = PipelineRunner::builder(config)
            .source(Arc::new(FixedSource(batch)))
            .query_client(Arc::new(EchoClient))
            .sink(sink.clone())
            .artifact_store(Arc::new(MemoryArtifactStore::new()))
            .credentials(Credentials::new("user", "secret"))
            .build()
            .unwrap();

        let report = runner.run(NaiveDate::from_ymd_opt(2020, 4, 30).unwrap()).await.unwrap();
        assert!(report.is_completed());
        assert_eq!(report.plan.task_count, 3);
        assert_eq!(report.records, Some(5));

        let delivered = sink.0.lock().unwrap().clone();
        let names: Vec<&str> = delivered.iter().map(|r| r[0].as_str()).collect();
        assert_eq!(names, vec!["person 0", "person 1", "person 2", "person 3", "person 4"]);
    }
}

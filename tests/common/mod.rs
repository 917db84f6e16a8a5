//! Fakes shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fanout::{
    ArtifactStore, CaseGroup, CaseRecord, Credentials, MemoryArtifactStore, MemoryRunState, PipelineConfig,
    PipelineRunner, QueryClient, QueryError, QuerySession, Record, RecordBatch, RecordSource, ResultSink,
    RetryStrategy, RunId, RunStateStore,
};

pub fn logical_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 4, 30).unwrap()
}

/// `n` records shaped `(id, name, date_of_birth)`
pub fn person_batch(n: usize) -> RecordBatch {
    (0..n).map(person).collect()
}

pub fn person(i: usize) -> Record {
    Record::new([i.to_string(), person_name(i), format!("01/{:02}/1980", i % 28 + 1)])
}

pub fn person_name(i: usize) -> String {
    format!("person {}", i)
}

/// Baseline configuration: capacity 3, immediate retries, no timeout
pub fn test_config() -> PipelineConfig {
    PipelineConfig::builder()
        .pipeline_name("jail_scraper")
        .capacity(3)
        .retries(3, RetryStrategy::Immediate)
        .worker_timeout(None)
        .build()
        .unwrap()
}

pub struct CountingSource {
    batch: RecordBatch,
    pub collects: AtomicUsize,
}

impl CountingSource {
    pub fn new(batch: RecordBatch) -> Arc<Self> {
        Arc::new(Self {
            batch,
            collects: AtomicUsize::new(0),
        })
    }

    pub fn collects(&self) -> usize {
        self.collects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for CountingSource {
    async fn collect(&self, _run: &RunId) -> anyhow::Result<RecordBatch> {
        self.collects.fetch_add(1, Ordering::SeqCst);
        Ok(self.batch.clone())
    }
}

/// How the fake service answers queries for one person
#[derive(Debug, Clone)]
pub enum Behavior {
    Answer,
    /// Fail transiently this many times, then answer
    FailTransient(u32),
    FailPermanent,
    /// Never answer
    Hang,
    /// Panic inside the worker task
    Panic,
}

#[derive(Default)]
pub struct ClientState {
    behaviors: Mutex<HashMap<String, Behavior>>,
    transient_failures: Mutex<HashMap<String, u32>>,
    pub queries: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

/// Query service fake: every person has two cases unless scripted otherwise
#[derive(Clone, Default)]
pub struct ScriptedClient {
    pub state: Arc<ClientState>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, name: impl Into<String>, behavior: Behavior) {
        self.state.behaviors.lock().unwrap().insert(name.into(), behavior);
    }

    pub fn reset(&self, name: &str) {
        self.state.behaviors.lock().unwrap().remove(name);
    }

    pub fn queries(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// The rows the fake returns for `name`, flattened
    pub fn cases_for(name: &str) -> Vec<CaseRecord> {
        Self::groups_for(name, "").into_iter().flatten().collect()
    }

    fn groups_for(name: &str, date_of_birth: &str) -> Vec<CaseGroup> {
        let _ = date_of_birth;
        vec![
            vec![vec![name.to_string(), "case 1".to_string()]],
            vec![vec![name.to_string(), "case 2".to_string()]],
        ]
    }
}

#[async_trait]
impl QueryClient for ScriptedClient {
    async fn open_session(&self, credentials: &Credentials) -> Result<Box<dyn QuerySession>, QueryError> {
        if credentials.user().is_empty() {
            return Err(QueryError::permanent("login rejected"));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            state: self.state.clone(),
        }))
    }
}

struct ScriptedSession {
    state: Arc<ClientState>,
}

#[async_trait]
impl QuerySession for ScriptedSession {
    async fn query(&mut self, name: &str, date_of_birth: &str) -> Result<Vec<CaseGroup>, QueryError> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .state
            .behaviors
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or(Behavior::Answer);

        match behavior {
            Behavior::Answer => Ok(ScriptedClient::groups_for(name, date_of_birth)),
            Behavior::FailTransient(times) => {
                let failed = {
                    let mut seen = self.state.transient_failures.lock().unwrap();
                    let count = seen.entry(name.to_string()).or_insert(0);
                    *count += 1;
                    *count
                };
                if failed <= times {
                    Err(QueryError::transient(format!("service unavailable for {}", name)))
                } else {
                    Ok(ScriptedClient::groups_for(name, date_of_birth))
                }
            }
            Behavior::FailPermanent => Err(QueryError::permanent(format!("no such person {}", name))),
            Behavior::Panic => panic!("query service client crashed on {}", name),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySink {
    deliveries: Mutex<Vec<Vec<CaseRecord>>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliveries(&self) -> Vec<Vec<CaseRecord>> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn deliver(&self, _run: &RunId, records: Vec<CaseRecord>) -> anyhow::Result<()> {
        self.deliveries.lock().unwrap().push(records);
        Ok(())
    }
}

/// Everything a test needs to drive and inspect one pipeline
pub struct Harness {
    pub source: Arc<CountingSource>,
    pub client: Arc<ScriptedClient>,
    pub sink: Arc<MemorySink>,
    pub store: Arc<dyn ArtifactStore>,
    pub state: Arc<dyn RunStateStore>,
}

impl Harness {
    pub fn new(batch: RecordBatch) -> Self {
        Self::with_backends(
            batch,
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(MemoryRunState::new()),
        )
    }

    pub fn with_backends(batch: RecordBatch, store: Arc<dyn ArtifactStore>, state: Arc<dyn RunStateStore>) -> Self {
        Self {
            source: CountingSource::new(batch),
            client: ScriptedClient::new(),
            sink: MemorySink::new(),
            store,
            state,
        }
    }

    pub fn runner(&self, config: PipelineConfig) -> PipelineRunner {
        PipelineRunner::builder(config)
            .source(self.source.clone())
            .query_client(self.client.clone())
            .sink(self.sink.clone())
            .artifact_store(self.store.clone())
            .run_state(self.state.clone())
            .credentials(Credentials::new("clerk", "hunter2"))
            .build()
            .unwrap()
    }
}

/// Give sessions dropped on abort a chance to run their close task
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

//! PipelineRunner - the control loop of one fan-out run
//!
//! A run goes through two phases. The planning phase runs the producer and
//! the partition units and persists the fan-out width. The execution phase
//! seals that width, materializes exactly that many workers, runs them
//! concurrently and finally fans in through the consumer.
//!
//! Every unit is idempotent, so re-running the same logical date only redoes
//! the units that never committed.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use super::aggregator::Aggregator;
use super::credentials::Credentials;
use super::events::{EventBus, RunEvent};
use super::interfaces::{QueryClient, RecordSource, ResultSink};
use super::report::{RunReport, RunStatus, UnitReport, UnitStatus};
use super::worker::WorkerContext;
use crate::core::config::{PipelineConfig, RetryStrategy};
use crate::core::errors::{FailureKind, FanoutError, Result};
use crate::graph::{TaskGraph, TaskKind};
use crate::model::{RecordBatch, RunId};
use crate::partition::{split_batch, FanoutPlanner, HeaderPolicy, PlanRecord};
use crate::storage::{
    ArtifactLayout, ArtifactStore, FsArtifactStore, MemoryRunState, RunStateStore, SledRunState,
};
use crate::unit::{envelope, IdempotentUnit, RunSalts, UnitOutcome, UnitRun};

/// Completion marker of the partition unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub task_count: usize,
    pub capacity: usize,
    /// Data rows partitioned, header excluded
    pub records: usize,
}

/// Retry settings handed to every worker supervisor
#[derive(Debug, Clone)]
struct RetryPolicy {
    max_attempts: u32,
    strategy: RetryStrategy,
    timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Backoff before the attempt after `attempt` (1-based), with up to 10% jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.strategy.delay_for(attempt.saturating_sub(1));
        let spread = (base.as_millis() as u64) / 10;
        base + Duration::from_millis(fastrand::u64(0..=spread))
    }
}

pub struct PipelineRunner {
    config: PipelineConfig,
    source: Arc<dyn RecordSource>,
    client: Arc<dyn QueryClient>,
    sink: Arc<dyn ResultSink>,
    store: Arc<dyn ArtifactStore>,
    planner: FanoutPlanner,
    credentials: Credentials,
    events: EventBus,
}

impl PipelineRunner {
    pub fn builder(config: PipelineConfig) -> PipelineRunnerBuilder {
        PipelineRunnerBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn planner(&self) -> &FanoutPlanner {
        &self.planner
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Subscribe to progress events of subsequent runs
    pub fn subscribe(&self) -> async_broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn run_id(&self, logical_date: NaiveDate) -> RunId {
        RunId::new(self.config.pipeline_name.clone(), logical_date)
    }

    pub fn layout(&self, run: &RunId) -> ArtifactLayout {
        ArtifactLayout::new(run.clone())
    }

    pub fn salts(&self, run: &RunId) -> RunSalts {
        if self.config.salted {
            RunSalts::derive(run, &self.config.versions, self.config.capacity, self.config.skip_header)
        } else {
            RunSalts::unsalted()
        }
    }

    fn worker_context(&self, run: &RunId) -> WorkerContext {
        WorkerContext {
            store: self.store.clone(),
            client: self.client.clone(),
            credentials: self.credentials.clone(),
            layout: self.layout(run),
            salts: self.salts(run),
            fields: self.config.fields,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_attempts,
            strategy: self.config.retry_strategy.clone(),
            timeout: self.config.worker_timeout(),
        }
    }

    /// Producer unit: collect the batch once per run and reuse it afterwards
    pub async fn produce(&self, run: &RunId) -> Result<UnitRun<RecordBatch>> {
        let salts = self.salts(run);
        let key = self.layout(run).batch_key(salts.collect.as_ref());
        let unit = IdempotentUnit::new(TaskKind::Producer.node_id(), key, self.store.as_ref());

        let source = self.source.as_ref();
        let produced = unit
            .run(move || async move { source.collect(run).await.map_err(FanoutError::from) })
            .await?;
        self.publish_outcome(&TaskKind::Producer, produced.outcome);
        Ok(produced)
    }

    /// Partition unit: split the batch, persist the fan-out width, write one
    /// chunk artifact per worker and finally the manifest
    ///
    /// When the manifest already exists, its width is checked against the
    /// persisted plan instead.
    pub async fn partition(&self, run: &RunId, batch: &RecordBatch) -> Result<UnitRun<PartitionManifest>> {
        let salts = self.salts(run);
        let layout = self.layout(run);
        let partition_salt = salts.partition.as_ref();
        let unit = IdempotentUnit::new(
            TaskKind::Partition.node_id(),
            layout.manifest_key(partition_salt),
            self.store.as_ref(),
        );

        let capacity = self.config.capacity;
        let policy = HeaderPolicy::from_flag(self.config.skip_header);
        let store = self.store.as_ref();
        let planner = &self.planner;
        let layout_ref = &layout;

        let partitioned = unit
            .run(move || async move {
                let chunks = split_batch(batch, capacity, policy)?;
                let task_count = FanoutPlanner::plan(&chunks);
                let previous = planner.load(run, partition_salt).await?;
                planner.persist(run, partition_salt, task_count, capacity).await?;

                // A replaced plan may have been wider; only chunks 0..N may remain
                if let Some(previous) = previous {
                    for index in task_count..previous.task_count {
                        let stale = layout_ref.chunk_key(index, partition_salt);
                        if store.remove(&stale).await? {
                            debug!(run = %run, key = %stale, "Removed chunk of replaced plan");
                        }
                    }
                }

                for chunk in &chunks {
                    let key = layout_ref.chunk_key(chunk.index, partition_salt);
                    store.write_atomic(&key, &envelope::encode(&key, chunk)?).await?;
                }
                Ok(PartitionManifest {
                    task_count,
                    capacity,
                    records: policy.data_rows(batch).len(),
                })
            })
            .await?;

        if partitioned.outcome == UnitOutcome::Skipped {
            let manifest = partitioned.value;
            self.planner
                .persist(run, partition_salt, manifest.task_count, manifest.capacity)
                .await?;
        }
        self.publish_outcome(&TaskKind::Partition, partitioned.outcome);
        self.events.publish(RunEvent::PlanPersisted {
            run: run.to_string(),
            task_count: partitioned.value.task_count,
        });
        Ok(partitioned)
    }

    /// Read the persisted width once, seal it and build the worker layer
    pub async fn materialize(&self, run: &RunId) -> Result<(PlanRecord, TaskGraph)> {
        let salts = self.salts(run);
        let partition_salt = salts.partition.as_ref();
        if self.planner.load(run, partition_salt).await?.is_none() {
            return Err(FanoutError::internal(format!(
                "no fan-out plan persisted for {}; run the partition first",
                run
            )));
        }
        let plan = self.planner.seal(run, partition_salt).await?;
        let mut graph = TaskGraph::plan_phase();
        graph.materialize(&plan)?;
        info!(run = %run, workers = plan.task_count, "Materialized workers");
        Ok((plan, graph))
    }

    /// Fan-in: aggregate every worker artifact and deliver the result
    pub async fn consume(&self, run: &RunId, task_count: usize) -> Result<usize> {
        let layout = self.layout(run);
        let salts = self.salts(run);
        let delivered = Aggregator::new(self.store.as_ref(), &layout, &salts)
            .consume(run, task_count, self.sink.as_ref())
            .await?;
        self.events.publish(RunEvent::ConsumerFinished {
            run: run.to_string(),
            records: delivered,
        });
        Ok(delivered)
    }

    /// Run the pipeline for `logical_date` to completion
    pub async fn run(&self, logical_date: NaiveDate) -> Result<RunReport> {
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        self.run_with_cancel(logical_date, cancel_rx).await
    }

    /// Run the pipeline, stopping the worker phase when `cancel` fires
    ///
    /// Planning-phase failures, plan drift and missing worker artifacts are
    /// returned as errors. Worker failures are isolated and reported in the
    /// returned [`RunReport`].
    #[instrument(skip(self, cancel), fields(pipeline = %self.config.pipeline_name))]
    pub async fn run_with_cancel(
        &self,
        logical_date: NaiveDate,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<RunReport> {
        let run = self.run_id(logical_date);
        let attempt_id = uuid::Uuid::new_v4().to_string();
        info!(run = %run, attempt_id = %attempt_id, "Starting run");

        let mut units = Vec::new();

        let produced = self.produce(&run).await?;
        units.push(UnitReport {
            unit: TaskKind::Producer,
            status: produced.outcome.into(),
            attempts: 1,
        });

        let partitioned = self.partition(&run, &produced.value).await?;
        units.push(UnitReport {
            unit: TaskKind::Partition,
            status: partitioned.outcome.into(),
            attempts: 1,
        });

        let (plan, graph) = self.materialize(&run).await?;

        let (worker_reports, cancelled) = self.execute_workers(&run, &graph, &mut cancel).await;
        let failed: Vec<usize> = worker_reports
            .iter()
            .filter_map(|r| match (r.unit, &r.status) {
                (TaskKind::Worker(index), UnitStatus::Failed { .. }) => Some(index),
                _ => None,
            })
            .collect();
        units.extend(worker_reports);

        let (status, records) = if cancelled {
            warn!(run = %run, "Run cancelled during worker phase");
            (RunStatus::Cancelled, None)
        } else if !failed.is_empty() {
            warn!(run = %run, failed = ?failed, "Workers failed; consumer blocked");
            (RunStatus::Blocked { failed }, None)
        } else {
            let delivered = self.consume(&run, plan.task_count).await?;
            units.push(UnitReport {
                unit: TaskKind::Consumer,
                status: UnitStatus::Executed,
                attempts: 1,
            });
            (RunStatus::Completed, Some(delivered))
        };

        info!(run = %run, attempt_id = %attempt_id, status = ?status, "Run finished");
        Ok(RunReport {
            run,
            attempt_id,
            plan,
            units,
            status,
            records,
        })
    }

    /// Re-run one worker of an already planned run
    ///
    /// Neither the partition nor the other workers are touched.
    pub async fn run_worker(&self, logical_date: NaiveDate, index: usize) -> Result<UnitReport> {
        let run = self.run_id(logical_date);
        let (_, graph) = self.materialize(&run).await?;
        if !graph.contains(&TaskKind::Worker(index)) {
            return Err(FanoutError::internal(format!(
                "worker {} is not part of run {} ({} workers)",
                index,
                run,
                graph.task_count().unwrap_or(0)
            )));
        }
        let report = supervise_worker(
            self.worker_context(&run),
            index,
            self.retry_policy(),
            Arc::new(Semaphore::new(1)),
            self.events.clone(),
        )
        .await;
        Ok(report)
    }

    async fn execute_workers(
        &self,
        run: &RunId,
        graph: &TaskGraph,
        cancel: &mut oneshot::Receiver<()>,
    ) -> (Vec<UnitReport>, bool) {
        let workers = graph.workers();
        if workers.is_empty() {
            return (Vec::new(), false);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_workers.max(1)));
        let (report_tx, mut report_rx) = mpsc::channel::<UnitReport>(workers.len());
        let ctx = self.worker_context(run);
        let policy = self.retry_policy();

        let mut handles = Vec::with_capacity(workers.len());
        for kind in workers {
            let TaskKind::Worker(index) = kind else {
                continue;
            };
            let ctx = ctx.clone();
            let policy = policy.clone();
            let semaphore = semaphore.clone();
            let events = self.events.clone();
            let report_tx = report_tx.clone();
            let handle = tokio::spawn(async move {
                let report = supervise_worker(ctx, index, policy, semaphore, events).await;
                let _ = report_tx.send(report).await;
            });
            handles.push((index, handle));
        }
        drop(report_tx);

        let mut reports = BTreeMap::new();
        let mut cancelled = false;
        let mut cancel_open = true;
        loop {
            tokio::select! {
                report = report_rx.recv() => match report {
                    Some(report) => {
                        reports.insert(report.unit, report);
                    }
                    None => break,
                },
                signal = &mut *cancel, if cancel_open => match signal {
                    Ok(()) => {
                        info!(run = %run, "Cancel signal received, aborting workers");
                        for (_, handle) in &handles {
                            handle.abort();
                        }
                        cancelled = true;
                        break;
                    }
                    // sender dropped without cancelling
                    Err(_) => cancel_open = false,
                },
            }
        }

        // Aborted tasks drop their futures here, which releases sessions and
        // discards uncommitted temp files.
        let mut lost = BTreeMap::new();
        let mut indices = Vec::with_capacity(handles.len());
        for (index, handle) in handles {
            indices.push(index);
            if let Err(e) = handle.await {
                match FanoutError::from(e) {
                    FanoutError::Cancelled => {}
                    err => {
                        error!(run = %run, index, error = %err, "Worker task lost");
                        lost.insert(index, err);
                    }
                }
            }
        }
        while let Ok(report) = report_rx.try_recv() {
            reports.insert(report.unit, report);
        }

        // Every worker gets a report, even when its task never sent one
        for index in indices {
            let unit = TaskKind::Worker(index);
            if reports.contains_key(&unit) {
                continue;
            }
            let status = match lost.remove(&index) {
                Some(err) => {
                    self.events.publish(RunEvent::UnitFailed {
                        unit: unit.node_id(),
                        kind: FailureKind::Permanent,
                        cause: err.to_string(),
                    });
                    UnitStatus::Failed {
                        kind: FailureKind::Permanent,
                        cause: err.to_string(),
                    }
                }
                None => UnitStatus::Cancelled,
            };
            reports.insert(
                unit,
                UnitReport {
                    unit,
                    status,
                    attempts: 0,
                },
            );
        }

        (reports.into_values().collect(), cancelled)
    }

    fn publish_outcome(&self, unit: &TaskKind, outcome: UnitOutcome) {
        publish_outcome(&self.events, unit, outcome);
    }
}

fn publish_outcome(events: &EventBus, unit: &TaskKind, outcome: UnitOutcome) {
    let unit = unit.node_id();
    events.publish(match outcome {
        UnitOutcome::Executed => RunEvent::UnitCommitted { unit },
        UnitOutcome::Skipped => RunEvent::UnitSkipped { unit },
    });
}

/// Run worker `index` until it commits, fails permanently or runs out of attempts
async fn supervise_worker(
    ctx: WorkerContext,
    index: usize,
    policy: RetryPolicy,
    semaphore: Arc<Semaphore>,
    events: EventBus,
) -> UnitReport {
    let unit = TaskKind::Worker(index);
    let name = unit.node_id();

    let mut attempt = 0;
    loop {
        attempt += 1;
        // held for a single attempt, released before any backoff
        let permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return UnitReport {
                    unit,
                    status: UnitStatus::Failed {
                        kind: FailureKind::Permanent,
                        cause: format!("worker pool closed: {}", e),
                    },
                    attempts: attempt - 1,
                }
            }
        };
        events.publish(RunEvent::UnitStarted {
            unit: name.clone(),
            attempt,
        });

        let result = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, ctx.run(index)).await {
                Ok(result) => result,
                Err(_) => Err(FanoutError::unit_failed(
                    name.clone(),
                    FailureKind::Transient,
                    format!("timed out after {:?}", limit),
                )),
            },
            None => ctx.run(index).await,
        };
        drop(permit);

        match result {
            Ok(done) => {
                publish_outcome(&events, &unit, done.outcome);
                return UnitReport {
                    unit,
                    status: done.outcome.into(),
                    attempts: attempt,
                };
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    unit = %name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Worker attempt failed, retrying"
                );
                events.publish(RunEvent::UnitRetrying {
                    unit: name.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let kind = e.failure_kind();
                error!(unit = %name, attempt, kind = %kind, category = e.category(), error = %e, "Worker failed");
                events.publish(RunEvent::UnitFailed {
                    unit: name.clone(),
                    kind,
                    cause: e.to_string(),
                });
                return UnitReport {
                    unit,
                    status: UnitStatus::Failed {
                        kind,
                        cause: e.to_string(),
                    },
                    attempts: attempt,
                };
            }
        }
    }
}

/// Builder for [`PipelineRunner`]
pub struct PipelineRunnerBuilder {
    config: PipelineConfig,
    source: Option<Arc<dyn RecordSource>>,
    client: Option<Arc<dyn QueryClient>>,
    sink: Option<Arc<dyn ResultSink>>,
    store: Option<Arc<dyn ArtifactStore>>,
    state: Option<Arc<dyn RunStateStore>>,
    credentials: Option<Credentials>,
}

impl PipelineRunnerBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            source: None,
            client: None,
            sink: None,
            store: None,
            state: None,
            credentials: None,
        }
    }

    pub fn source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn query_client(mut self, client: Arc<dyn QueryClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Artifact store; defaults to the filesystem under `artifact_root`
    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run state; defaults to sled at `state_path`, or memory when unset
    pub fn run_state(mut self, state: Arc<dyn RunStateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Credentials; default to the configured environment variables
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn build(self) -> Result<PipelineRunner> {
        self.config.validate()?;

        let source = self
            .source
            .ok_or_else(|| FanoutError::configuration("a record source is required"))?;
        let client = self
            .client
            .ok_or_else(|| FanoutError::configuration("a query client is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| FanoutError::configuration("a result sink is required"))?;

        let store: Arc<dyn ArtifactStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FsArtifactStore::new(self.config.artifact_root.clone())),
        };
        let state: Arc<dyn RunStateStore> = match (self.state, &self.config.state_path) {
            (Some(state), _) => state,
            (None, Some(path)) => Arc::new(SledRunState::open(path)?),
            (None, None) => Arc::new(MemoryRunState::new()),
        };
        let credentials = match self.credentials {
            Some(credentials) => credentials,
            None => Credentials::from_env(
                &self.config.credentials_user_env,
                &self.config.credentials_password_env,
            )?,
        };

        Ok(PipelineRunner {
            events: EventBus::new(self.config.event_capacity),
            planner: FanoutPlanner::new(state),
            config: self.config,
            source,
            client,
            sink,
            store,
            credentials,
        })
    }
}

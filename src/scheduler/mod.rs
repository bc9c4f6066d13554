//! Scheduler
//!
//! The central coordinator. One loop owns the dependency graph, the ready
//! queue, and every task-state transition; workers, providers, and the
//! store are shared handles. Dispatch runs in spawned tasks that report
//! back over a single completion channel, so the loop never waits on
//! provider I/O. Store failures halt scheduling; nothing is silently
//! dropped.

mod engine;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use taskmesh_dispatch::{DispatchRequest, DispatchResult, Dispatcher};
use taskmesh_graph::{DepGraph, GraphError, UPSTREAM_FAILURE};
use taskmesh_store::{task_key, DurableStore, StoreError};
use taskmesh_types::{
    ErrorKind, Event, EventBody, LeaseToken, ProviderId, TaskFailure, TaskId, TaskRecord,
    TaskState, WorkerId, WorkerSpec, WorkerRecord,
};

use crate::api::{SubmitError, SubmitRequest, TaskFilter};
use crate::bus::EventBus;
use crate::config::MeshConfig;
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::pool::{ExpiredWorker, PoolError, WorkOutcome, WorkerPool};
use crate::providers::{BreakerEvent, ProviderRegistry};
use crate::queue::{compose_score, ReadyQueue, ScoreInputs};
use crate::recovery::{CheckpointInput, RecoveredState, RecoveryManager};

pub use engine::{BootError, Engine, EngineRuntime};

/// Fatal scheduler failures. Anything here halts the loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Durable store failure: {0}")]
    Store(#[from] StoreError),
}

/// Requests crossing from `EngineHandle` into the loop.
pub enum Command {
    Submit {
        request: SubmitRequest,
        reply: oneshot::Sender<Result<TaskId, SubmitError>>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<Result<TaskState, SubmitError>>,
    },
    Get {
        id: TaskId,
        reply: oneshot::Sender<Option<TaskRecord>>,
    },
    List {
        filter: TaskFilter,
        reply: oneshot::Sender<Vec<TaskRecord>>,
    },
    RegisterWorker {
        spec: WorkerSpec,
        reply: oneshot::Sender<Result<WorkerRecord, PoolError>>,
    },
    Heartbeat {
        id: WorkerId,
    },
    DrainWorker {
        id: WorkerId,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    Checkpoint {
        reply: oneshot::Sender<Result<String, SubmitError>>,
    },
    Metrics {
        reply: oneshot::Sender<MetricsSnapshot>,
    },
    CriticalPath {
        reply: oneshot::Sender<Vec<TaskId>>,
    },
    ExecutionOrder {
        reply: oneshot::Sender<Vec<TaskId>>,
    },
}

/// Messages from spawned dispatch tasks back to the loop. Each dispatch
/// sends `Started` and then exactly one terminal signal.
#[derive(Debug)]
pub(crate) enum DispatchSignal {
    Started { task: TaskId },
    Finished { task: TaskId, result: DispatchResult },
    CancelAck { task: TaskId },
    DeadlineExceeded { task: TaskId },
}

struct InFlight {
    lease: LeaseToken,
    provider: ProviderId,
    cancel_tx: watch::Sender<bool>,
}

/// Stable shard routing by task-id hash (FNV-1a). One shard is the
/// default; the routing stays stable as shard counts change only by
/// remapping ids, never by reordering within a shard.
pub fn shard_of(id: &TaskId, shards: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in id.as_str().bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    (hash % shards.max(1) as u64) as usize
}

/// Exponential backoff with jitter: `base * 2^retries` plus up to a
/// quarter of that again.
fn backoff_ms(base: u64, retry_count: u32) -> u64 {
    let exp = base.max(1).saturating_mul(1u64 << retry_count.min(16));
    let jitter = rand::thread_rng().gen_range(0..=exp / 4);
    exp + jitter
}

fn map_graph_err(err: GraphError) -> SubmitError {
    match err {
        GraphError::Duplicate(id) => SubmitError::Duplicate(id),
        GraphError::UnknownPrereq(id) => SubmitError::UnknownPrereq(id),
        GraphError::CycleDetected => SubmitError::CycleDetected,
        GraphError::UnknownTask(id) => SubmitError::UnknownTask(id),
        other => {
            warn!(error = %other, "Unexpected graph error on submission");
            SubmitError::CycleDetected
        }
    }
}

pub(crate) struct Scheduler {
    cfg: Arc<MeshConfig>,
    store: Arc<DurableStore>,
    bus: Arc<EventBus>,
    pool: Arc<WorkerPool>,
    registry: Arc<ProviderRegistry>,
    metrics: Arc<MetricsAggregator>,
    recovery: RecoveryManager,
    dispatcher: Arc<dyn Dispatcher>,

    graph: DepGraph,
    queue: ReadyQueue,
    tasks: HashMap<TaskId, TaskRecord>,
    /// Ready in the graph, not yet announced/queued.
    newly_ready: HashSet<TaskId>,
    inflight: HashMap<TaskId, InFlight>,
    /// Failed tasks waiting out their backoff, by due time.
    retry_backlog: BinaryHeap<Reverse<(DateTime<Utc>, TaskId)>>,
    /// Tasks skipped for lack of a provider, by due time.
    deferred: BinaryHeap<Reverse<(DateTime<Utc>, TaskId)>>,
    /// Cancel acknowledgement deadlines.
    cancel_waits: HashMap<TaskId, DateTime<Utc>>,
    /// Recovered tasks whose retry bump still needs a log entry.
    recovered_retries: Vec<TaskId>,

    commands_rx: mpsc::Receiver<Command>,
    signals_rx: mpsc::Receiver<DispatchSignal>,
    signals_tx: mpsc::Sender<DispatchSignal>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cfg: Arc<MeshConfig>,
        store: Arc<DurableStore>,
        bus: Arc<EventBus>,
        pool: Arc<WorkerPool>,
        registry: Arc<ProviderRegistry>,
        metrics: Arc<MetricsAggregator>,
        dispatcher: Arc<dyn Dispatcher>,
        recovered: RecoveredState,
        commands_rx: mpsc::Receiver<Command>,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::channel(1024);
        let now = Utc::now();

        let mut queue = ReadyQueue::new();
        for (id, score) in &recovered.queue {
            let ready_at = recovered
                .tasks
                .get(id)
                .and_then(|r| r.ready_at)
                .unwrap_or(now);
            queue.push(id.clone(), *score, ready_at);
        }

        Self {
            cfg,
            store: store.clone(),
            bus,
            pool,
            registry,
            metrics,
            recovery: RecoveryManager::new(store),
            dispatcher,
            graph: recovered.graph,
            queue,
            tasks: recovered.tasks,
            newly_ready: HashSet::new(),
            inflight: HashMap::new(),
            retry_backlog: BinaryHeap::new(),
            deferred: BinaryHeap::new(),
            cancel_waits: HashMap::new(),
            recovered_retries: recovered.requeued,
            commands_rx,
            signals_rx,
            signals_tx,
        }
    }

    /// The main loop. Runs until shutdown or a fatal store error.
    pub(crate) async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        self.bootstrap().await?;

        let mut tick =
            tokio::time::interval(StdDuration::from_millis(self.cfg.tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_checkpoint = tokio::time::Instant::now();

        info!("Scheduler started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *shutdown.borrow() {
                        if let Err(e) = self.checkpoint().await {
                            error!(error = %e, "Final checkpoint failed");
                        }
                        info!("Scheduler shutting down");
                        break;
                    }
                }
                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command).await?;
                }
                Some(signal) = self.signals_rx.recv() => {
                    self.handle_signal(signal).await?;
                    self.readiness_pass().await?;
                    self.dispatch_pass().await?;
                }
                _ = tick.tick() => {
                    self.housekeeping().await?;
                    self.readiness_pass().await?;
                    self.dispatch_pass().await?;
                    let interval = StdDuration::from_millis(self.cfg.snapshot_interval_ms);
                    if self.cfg.snapshot_interval_ms > 0 && last_checkpoint.elapsed() >= interval {
                        self.checkpoint().await?;
                        last_checkpoint = tokio::time::Instant::now();
                    }
                }
            }
        }
        Ok(())
    }

    /// One-time startup work: log the retry bumps recovery produced and
    /// advance dependents whose prerequisite completions beat the crash.
    async fn bootstrap(&mut self) -> Result<(), SchedulerError> {
        for id in std::mem::take(&mut self.recovered_retries) {
            let Some(mut record) = self.tasks.get(&id).cloned() else {
                continue;
            };
            let event = self
                .append(EventBody::TaskRetried {
                    task: id.clone(),
                    retry_count: record.retry_count,
                    backoff_ms: 0,
                })
                .await?;
            record.last_event_seq = event.seq;
            self.persist(&record).await?;
            self.tasks.insert(id, record);
            self.publish(&event);
        }

        for id in self.graph.pending_satisfied() {
            if self.graph.set_state(&id, TaskState::Ready).is_ok() {
                self.newly_ready.insert(id);
            }
        }
        self.readiness_pass().await?;
        Ok(())
    }

    // ── Events and persistence ────────────────────────────────────────────

    /// Append to the durable log. A failure here is fatal: the scheduler
    /// halts rather than run ahead of its own record.
    async fn append(&mut self, body: EventBody) -> Result<Event, SchedulerError> {
        match self.store.append(body).await {
            Ok(event) => Ok(event),
            Err(e) => {
                error!(error = %e, "Event append failed; halting scheduler");
                Err(e.into())
            }
        }
    }

    async fn persist(&mut self, record: &TaskRecord) -> Result<(), SchedulerError> {
        let bytes = serde_json::to_vec(record).map_err(StoreError::from)?;
        match self.store.put(&task_key(&record.id), &bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, task = %record.id, "Task record write failed; halting scheduler");
                Err(e.into())
            }
        }
    }

    fn publish(&self, event: &Event) {
        self.bus.publish(event.kind.topic(), event);
    }

    /// Append an event, stamp + persist the record, then publish. Keeps
    /// the read-after-write guarantee: by the time a subscriber sees the
    /// event, the KV already holds the new record state.
    async fn commit(
        &mut self,
        mut record: TaskRecord,
        body: EventBody,
    ) -> Result<TaskRecord, SchedulerError> {
        let event = self.append(body).await?;
        record.last_event_seq = event.seq;
        self.persist(&record).await?;
        self.tasks.insert(record.id.clone(), record.clone());
        self.publish(&event);
        Ok(record)
    }

    // ── Command handling ──────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) -> Result<(), SchedulerError> {
        match command {
            Command::Submit { request, reply } => {
                let result = self.handle_submit(request).await?;
                let _ = reply.send(result);
            }
            Command::Cancel { id, reply } => {
                let result = self.handle_cancel(id).await?;
                let _ = reply.send(result);
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.tasks.get(&id).cloned());
            }
            Command::List { filter, reply } => {
                let mut records: Vec<TaskRecord> = self
                    .tasks
                    .values()
                    .filter(|r| filter.matches(r))
                    .cloned()
                    .collect();
                records.sort_by(|a, b| (a.submitted_at, &a.id).cmp(&(b.submitted_at, &b.id)));
                let _ = reply.send(records);
            }
            Command::RegisterWorker { spec, reply } => {
                let now = Utc::now();
                match self.pool.register(spec, now) {
                    Ok(record) => {
                        let event = self
                            .append(EventBody::WorkerJoined {
                                worker: record.id.clone(),
                                capabilities: record.capabilities.clone(),
                                concurrency: record.concurrency,
                            })
                            .await?;
                        self.publish(&event);
                        let _ = reply.send(Ok(record));
                        self.dispatch_pass().await?;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Heartbeat { id } => {
                if let Err(e) = self.pool.heartbeat(&id, Utc::now()) {
                    debug!(worker = %id, error = %e, "Heartbeat for unknown worker");
                }
            }
            Command::DrainWorker { id, reply } => {
                let _ = reply.send(self.pool.drain(&id));
            }
            Command::Checkpoint { reply } => match self.checkpoint().await {
                Ok(name) => {
                    let _ = reply.send(Ok(name));
                }
                Err(e) => {
                    let _ = reply.send(Err(SubmitError::EngineStopped));
                    return Err(e);
                }
            },
            Command::Metrics { reply } => {
                let _ = reply.send(self.metrics.snapshot());
            }
            Command::CriticalPath { reply } => {
                let _ = reply.send(self.graph.critical_path());
            }
            Command::ExecutionOrder { reply } => {
                let _ = reply.send(self.graph.execution_order());
            }
        }
        Ok(())
    }

    async fn handle_submit(
        &mut self,
        request: SubmitRequest,
    ) -> Result<Result<TaskId, SubmitError>, SchedulerError> {
        let spec = match request.into_spec(self.cfg.max_payload_bytes) {
            Ok(spec) => spec,
            Err(e) => return Ok(Err(e)),
        };
        let id = spec.id.clone().unwrap_or_else(TaskId::generate);
        if self.tasks.contains_key(&id) {
            return Ok(Err(SubmitError::Duplicate(id)));
        }

        let now = Utc::now();
        let initial = match self
            .graph
            .insert(id.clone(), &spec.prereqs, spec.estimated_ms, now)
        {
            Ok(state) => state,
            Err(e) => return Ok(Err(map_graph_err(e))),
        };

        let mut record = TaskRecord::from_spec(id.clone(), spec, now);
        record.state = initial;
        if initial == TaskState::Ready {
            record.ready_at = Some(now);
        } else {
            record.ready_at = None;
        }

        let body = EventBody::TaskSubmitted {
            task: id.clone(),
            kind: record.kind.clone(),
            department: record.department,
            priority: record.priority,
            prereqs: record.prereqs.clone(),
        };
        self.commit(record, body).await?;

        if initial == TaskState::Ready {
            // Announced and queued by the next readiness pass, so a burst
            // of submissions logs all its submitted events first.
            self.newly_ready.insert(id.clone());
        }
        debug!(task = %id, state = %initial, "Task submitted");
        Ok(Ok(id))
    }

    async fn handle_cancel(
        &mut self,
        id: TaskId,
    ) -> Result<Result<TaskState, SubmitError>, SchedulerError> {
        let Some(record) = self.tasks.get(&id).cloned() else {
            return Ok(Err(SubmitError::UnknownTask(id)));
        };
        if record.state.is_terminal() {
            return Ok(Ok(record.state));
        }

        match record.state {
            TaskState::Pending | TaskState::Ready => {
                self.cancel_now(&id, "cancelled by request").await?;
                Ok(Ok(TaskState::Cancelled))
            }
            TaskState::Assigned | TaskState::Running => {
                if let Some(inflight) = self.inflight.get(&id) {
                    let _ = inflight.cancel_tx.send(true);
                }
                let grace = Duration::milliseconds(self.cfg.cancel_grace_ms as i64);
                self.cancel_waits.entry(id).or_insert_with(|| Utc::now() + grace);
                Ok(Ok(record.state))
            }
            _ => Ok(Ok(record.state)),
        }
    }

    /// Cancel a task immediately (not dispatched) and cascade to its
    /// dependents.
    async fn cancel_now(&mut self, id: &TaskId, cause: &str) -> Result<(), SchedulerError> {
        let cascade = match self.graph.mark_cancelled(id) {
            Ok(cascade) => cascade,
            Err(e) => {
                debug!(task = %id, error = %e, "Cancel on settled task");
                return Ok(());
            }
        };
        self.queue.remove(id);
        self.newly_ready.remove(id);

        if let Some(mut record) = self.tasks.get(id).cloned() {
            record.state = TaskState::Cancelled;
            record.cancel_cause = Some(cause.to_string());
            self.commit(
                record,
                EventBody::TaskCancelled {
                    task: id.clone(),
                    cause: cause.to_string(),
                },
            )
            .await?;
        }
        self.cancel_dependents(cascade).await?;
        Ok(())
    }

    /// Record the cancellation of cascade victims.
    async fn cancel_dependents(&mut self, cascade: Vec<TaskId>) -> Result<(), SchedulerError> {
        for dep in cascade {
            self.queue.remove(&dep);
            self.newly_ready.remove(&dep);
            if let Some(mut record) = self.tasks.get(&dep).cloned() {
                record.state = TaskState::Cancelled;
                record.cancel_cause = Some(UPSTREAM_FAILURE.to_string());
                self.commit(
                    record,
                    EventBody::TaskCancelled {
                        task: dep.clone(),
                        cause: UPSTREAM_FAILURE.to_string(),
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    // ── Dispatch signals ──────────────────────────────────────────────────

    async fn handle_signal(&mut self, signal: DispatchSignal) -> Result<(), SchedulerError> {
        match signal {
            DispatchSignal::Started { task } => {
                if !self.inflight.contains_key(&task) {
                    return Ok(());
                }
                if let Some(mut record) = self.tasks.get(&task).cloned() {
                    if record.state == TaskState::Assigned {
                        record.state = TaskState::Running;
                        let _ = self.graph.set_state(&task, TaskState::Running);
                        self.persist(&record).await?;
                        self.tasks.insert(task, record);
                    }
                }
            }
            DispatchSignal::Finished { task, result } => match result {
                DispatchResult::Succeeded {
                    tokens_consumed,
                    latency_ms,
                } => {
                    self.handle_success(task, tokens_consumed, latency_ms).await?;
                }
                DispatchResult::Failed { kind, detail } => {
                    self.settle_attempt(&task, kind.is_provider_related()).await?;
                    self.fail_task(&task, kind, &detail).await?;
                }
            },
            DispatchSignal::CancelAck { task } => {
                if self.inflight.contains_key(&task) {
                    self.settle_attempt(&task, false).await?;
                    self.cancel_waits.remove(&task);
                    self.cancel_now(&task, "cancelled by request").await?;
                }
            }
            DispatchSignal::DeadlineExceeded { task } => {
                self.settle_attempt(&task, true).await?;
                self.fail_task(&task, ErrorKind::TransientProvider, "dispatch deadline exceeded")
                    .await?;
            }
        }
        Ok(())
    }

    /// Close out the in-flight bookkeeping for one failed or abandoned
    /// attempt: release the worker lease and either feed the provider's
    /// breaker (when the failure implicates it) or free its probe slot.
    async fn settle_attempt(
        &mut self,
        task: &TaskId,
        provider_at_fault: bool,
    ) -> Result<(), SchedulerError> {
        let Some(inflight) = self.inflight.remove(task) else {
            return Ok(());
        };
        let outcome = WorkOutcome {
            success: false,
            latency_ms: 0,
        };
        if let Err(e) = self.pool.release(&inflight.lease, outcome) {
            debug!(task = %task, error = %e, "Lease already gone on release");
        }
        if provider_at_fault {
            let now = Utc::now();
            if let Ok(Some(BreakerEvent::Opened)) =
                self.registry.record_failure(&inflight.provider, now)
            {
                let event = self
                    .append(EventBody::ProviderOpened {
                        provider: inflight.provider.clone(),
                    })
                    .await?;
                self.publish(&event);
            }
        } else {
            // Not the provider's doing; a claimed half-open probe slot
            // must not stay reserved.
            self.registry.abort(&inflight.provider);
        }
        Ok(())
    }

    async fn handle_success(
        &mut self,
        task: TaskId,
        tokens_consumed: u64,
        latency_ms: u64,
    ) -> Result<(), SchedulerError> {
        let Some(inflight) = self.inflight.remove(&task) else {
            debug!(task = %task, "Completion for task no longer in flight");
            return Ok(());
        };
        if let Err(e) = self.pool.release(
            &inflight.lease,
            WorkOutcome {
                success: true,
                latency_ms,
            },
        ) {
            debug!(task = %task, error = %e, "Lease already gone on release");
        }
        let now = Utc::now();
        if let Ok(Some(BreakerEvent::Closed)) =
            self.registry
                .record_success(&inflight.provider, tokens_consumed, latency_ms, now)
        {
            let event = self
                .append(EventBody::ProviderClosed {
                    provider: inflight.provider.clone(),
                })
                .await?;
            self.publish(&event);
        }

        let Some(mut record) = self.tasks.get(&task).cloned() else {
            return Ok(());
        };
        if record.state.is_terminal() {
            debug!(task = %task, state = %record.state, "Late completion ignored");
            return Ok(());
        }
        self.cancel_waits.remove(&task);

        let newly = match self.graph.mark_succeeded(&task) {
            Ok(newly) => newly,
            Err(e) => {
                debug!(task = %task, error = %e, "Graph already settled this task");
                return Ok(());
            }
        };
        record.state = TaskState::Succeeded;
        let worker = inflight.lease.worker.clone();
        self.commit(
            record,
            EventBody::TaskCompleted {
                task: task.clone(),
                worker,
                provider: inflight.provider,
                tokens_consumed,
                latency_ms,
            },
        )
        .await?;

        self.newly_ready.extend(newly);
        Ok(())
    }

    /// Apply the retry policy to a failed attempt. Retry wins while
    /// retries remain; only permanent failure cascades cancellation.
    async fn fail_task(
        &mut self,
        task: &TaskId,
        kind: ErrorKind,
        detail: &str,
    ) -> Result<(), SchedulerError> {
        let Some(mut record) = self.tasks.get(task).cloned() else {
            return Ok(());
        };
        if record.state.is_terminal() {
            debug!(task = %task, "Failure signal for settled task ignored");
            return Ok(());
        }
        // A pending cancel outranks the retry policy.
        if self.cancel_waits.remove(task).is_some() {
            return self.cancel_now(task, "cancelled by request").await;
        }

        let provider = record.assigned_provider.clone();
        record.last_failure = Some(TaskFailure::new(kind, detail));
        record.assigned_worker = None;
        record.assigned_provider = None;

        let task_retryable = kind != ErrorKind::Validation;
        if task_retryable && record.can_retry() {
            let backoff = backoff_ms(self.cfg.retry_base_delay_ms, record.retry_count);
            record.retry_count += 1;
            let retry_count = record.retry_count;
            let due = Utc::now() + Duration::milliseconds(backoff as i64);

            let mut record = self
                .commit(
                    record,
                    EventBody::TaskFailed {
                        task: task.clone(),
                        error_kind: kind,
                        detail: detail.to_string(),
                        provider,
                        terminal: false,
                    },
                )
                .await?;
            record.state = TaskState::Ready;
            record.ready_at = Some(due);
            let _ = self.graph.set_state(task, TaskState::Ready);
            self.commit(
                record,
                EventBody::TaskRetried {
                    task: task.clone(),
                    retry_count,
                    backoff_ms: backoff,
                },
            )
            .await?;
            self.retry_backlog.push(Reverse((due, task.clone())));
            info!(task = %task, backoff_ms = backoff, "Task scheduled for retry");
        } else {
            record.state = TaskState::Failed;
            self.commit(
                record,
                EventBody::TaskFailed {
                    task: task.clone(),
                    error_kind: kind,
                    detail: detail.to_string(),
                    provider,
                    terminal: true,
                },
            )
            .await?;
            let cascade = match self.graph.mark_failed_permanent(task) {
                Ok(cascade) => cascade,
                Err(e) => {
                    debug!(task = %task, error = %e, "Graph already settled this task");
                    Vec::new()
                }
            };
            warn!(task = %task, kind = %kind, "Task permanently failed");
            self.cancel_dependents(cascade).await?;
        }
        Ok(())
    }

    // ── Scheduling passes ─────────────────────────────────────────────────

    /// Announce and enqueue every task that became ready since the last
    /// pass.
    async fn readiness_pass(&mut self) -> Result<(), SchedulerError> {
        if self.newly_ready.is_empty() {
            return Ok(());
        }
        let mut batch: Vec<TaskId> = self.newly_ready.drain().collect();
        batch.sort_by(|a, b| {
            let (ra, rb) = (&self.tasks[a], &self.tasks[b]);
            (ra.submitted_at, a).cmp(&(rb.submitted_at, b))
        });
        let now = Utc::now();
        for id in batch {
            let Some(mut record) = self.tasks.get(&id).cloned() else {
                continue;
            };
            if self.graph.state(&id) != Some(TaskState::Ready) {
                continue;
            }
            record.state = TaskState::Ready;
            record.ready_at = Some(now);
            let record = self
                .commit(record, EventBody::TaskReady { task: id.clone() })
                .await?;
            let score = self.score_for(&record, now);
            self.queue.push(id, score, now);
        }
        Ok(())
    }

    fn score_for(&self, record: &TaskRecord, now: DateTime<Utc>) -> u64 {
        compose_score(
            &ScoreInputs {
                priority: record.priority,
                unresolved_dependents: self.graph.unresolved_dependent_count(&record.id),
                ready_at: record.ready_at.unwrap_or(now),
                deadline: record.deadline,
            },
            now,
        )
    }

    /// Match queued tasks to workers and providers until something runs
    /// out.
    async fn dispatch_pass(&mut self) -> Result<(), SchedulerError> {
        loop {
            let Some(top) = self.queue.peek().cloned() else {
                break;
            };
            let Some(record) = self.tasks.get(&top).cloned() else {
                self.queue.pop();
                continue;
            };
            if record.state != TaskState::Ready {
                self.queue.pop();
                continue;
            }

            let now = Utc::now();
            let lease = match self.pool.reserve(&record.capabilities, &top, now) {
                Ok(lease) => lease,
                Err(PoolError::NoWorker) => break,
                Err(e) => {
                    warn!(task = %top, error = %e, "Reservation failed");
                    break;
                }
            };

            let mode = record
                .cost_mode
                .as_deref()
                .unwrap_or(&self.cfg.default_cost_mode);
            let provider = match self.registry.select(&record.capabilities, Some(mode), now) {
                Ok(provider) => provider,
                Err(_) => {
                    // No provider right now: give back the worker and let
                    // the task sit out one backoff interval off-queue.
                    if let Err(e) = self.pool.cancel_lease(&lease) {
                        debug!(error = %e, "Lease cleanup after failed selection");
                    }
                    self.queue.pop();
                    let due = now
                        + Duration::milliseconds(self.cfg.retry_base_delay_ms as i64);
                    self.deferred.push(Reverse((due, top.clone())));
                    debug!(task = %top, "No provider available; deferring");
                    continue;
                }
            };

            let id = self.queue.pop().expect("peeked entry");
            let mut record = record;
            record.state = TaskState::Assigned;
            record.assigned_worker = Some(lease.worker.clone());
            record.assigned_provider = Some(provider.clone());
            let _ = self.graph.set_state(&id, TaskState::Assigned);
            let record = self
                .commit(
                    record,
                    EventBody::TaskAssigned {
                        task: id.clone(),
                        worker: lease.worker.clone(),
                        provider: provider.clone(),
                    },
                )
                .await?;

            self.spawn_dispatch(record, lease, provider, now);
        }
        Ok(())
    }

    /// Hand one assignment to the dispatcher in its own task. The loop
    /// never blocks on it; the deadline and cancellation are enforced
    /// here, around the dispatcher.
    fn spawn_dispatch(
        &mut self,
        record: TaskRecord,
        lease: LeaseToken,
        provider: ProviderId,
        now: DateTime<Utc>,
    ) {
        let default_deadline = now + Duration::milliseconds(self.cfg.dispatch_timeout_ms as i64);
        let deadline = match record.deadline {
            Some(deadline) if deadline < default_deadline => deadline,
            _ => default_deadline,
        };

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let task = record.id.clone();
        self.inflight.insert(
            task.clone(),
            InFlight {
                lease: lease.clone(),
                provider: provider.clone(),
                cancel_tx,
            },
        );

        let request = DispatchRequest {
            task: task.clone(),
            kind: record.kind.clone(),
            payload: record.payload.clone(),
            worker: lease.worker.clone(),
            provider,
            deadline,
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let signals = self.signals_tx.clone();

        tokio::spawn(async move {
            let _ = signals
                .send(DispatchSignal::Started { task: task.clone() })
                .await;

            let timeout = (deadline - Utc::now())
                .to_std()
                .unwrap_or(StdDuration::ZERO);
            let signal = tokio::select! {
                result = dispatcher.execute(&request) => {
                    DispatchSignal::Finished { task: task.clone(), result }
                }
                _ = tokio::time::sleep(timeout) => {
                    DispatchSignal::DeadlineExceeded { task: task.clone() }
                }
                _ = cancelled(&mut cancel_rx) => {
                    DispatchSignal::CancelAck { task: task.clone() }
                }
            };
            let _ = signals.send(signal).await;
        });
    }

    // ── Housekeeping ──────────────────────────────────────────────────────

    async fn housekeeping(&mut self) -> Result<(), SchedulerError> {
        let now = Utc::now();

        // Workers that stopped heartbeating: their in-flight tasks go back
        // to the queue as worker faults.
        for expired in self.pool.tick(now) {
            self.handle_worker_expiry(expired).await?;
        }

        // Breaker cooldowns and daily quota resets.
        for (provider, event) in self.registry.tick(now) {
            if event == BreakerEvent::HalfOpened {
                debug!(provider = %provider, "Breaker half-open; next request probes");
            }
        }

        // Retries whose backoff elapsed.
        while let Some(Reverse((due, _))) = self.retry_backlog.peek() {
            if *due > now {
                break;
            }
            let Reverse((_, task)) = self.retry_backlog.pop().expect("peeked");
            if self.graph.state(&task) == Some(TaskState::Ready) {
                self.newly_ready.insert(task);
            }
        }

        // Deferred tasks (no provider earlier) whose pause elapsed.
        while let Some(Reverse((due, _))) = self.deferred.peek() {
            if *due > now {
                break;
            }
            let Reverse((_, task)) = self.deferred.pop().expect("peeked");
            if self.graph.state(&task) == Some(TaskState::Ready) && !self.queue.contains(&task) {
                if let Some(record) = self.tasks.get(&task).cloned() {
                    let score = self.score_for(&record, now);
                    self.queue
                        .push(task, score, record.ready_at.unwrap_or(now));
                }
            }
        }

        // Cancels whose acknowledgement grace expired.
        let overdue: Vec<TaskId> = self
            .cancel_waits
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for task in overdue {
            warn!(task = %task, "Cancel acknowledgement timed out; force-terminating");
            self.cancel_waits.remove(&task);
            if let Some(inflight) = self.inflight.remove(&task) {
                if let Err(e) = self.pool.cancel_lease(&inflight.lease) {
                    debug!(error = %e, "Lease cleanup on forced cancel");
                }
                self.registry.abort(&inflight.provider);
            }
            self.cancel_now(&task, "cancelled by request").await?;
        }

        // Wait-bonus refresh for the head of the queue.
        let tasks = &self.tasks;
        let graph = &self.graph;
        self.queue.sweep(self.cfg.rescore_top_k, |id, ready_at| {
            let record = tasks.get(id);
            compose_score(
                &ScoreInputs {
                    priority: record
                        .map(|r| r.priority)
                        .unwrap_or(taskmesh_types::Priority::Low),
                    unresolved_dependents: graph.unresolved_dependent_count(id),
                    ready_at,
                    deadline: record.and_then(|r| r.deadline),
                },
                now,
            )
        });

        for alert in self.metrics.set_queue_depth(self.queue.len() as u64) {
            self.bus.publish("alert", &alert);
        }
        Ok(())
    }

    async fn handle_worker_expiry(&mut self, expired: ExpiredWorker) -> Result<(), SchedulerError> {
        let event = self
            .append(EventBody::WorkerLeft {
                worker: expired.worker.clone(),
                reason: "heartbeat timeout".to_string(),
            })
            .await?;
        self.publish(&event);

        for task in expired.orphaned_tasks {
            // The lease is already gone; drop the in-flight entry so the
            // straggling dispatch signal is ignored, then retry the task.
            self.inflight.remove(&task);
            self.fail_task(&task, ErrorKind::WorkerFault, "worker heartbeat lost")
                .await?;
        }
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<String, SchedulerError> {
        let input = CheckpointInput {
            edges: self.graph.edges(),
            queue: self.queue.ordered_snapshot(),
            workers: self.pool.list(),
            providers: self.registry.status(),
        };
        let (name, seq) = self.recovery.checkpoint(input).await?;
        let event = self
            .append(EventBody::CheckpointWritten {
                snapshot: name.clone(),
                last_seq: seq,
            })
            .await?;
        self.publish(&event);
        Ok(name)
    }
}

/// Resolve when the cancel flag flips to true. If the sender is dropped
/// without cancelling, park forever and let the other select arms win.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Provider involvement test for breaker feeding.
trait ProviderRelated {
    fn is_provider_related(&self) -> bool;
}

impl ProviderRelated for ErrorKind {
    fn is_provider_related(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientProvider | ErrorKind::PermanentProvider
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_routing_is_stable() {
        let id = TaskId::new("task-42");
        let first = shard_of(&id, 8);
        for _ in 0..10 {
            assert_eq!(shard_of(&id, 8), first);
        }
        assert!(first < 8);
        // One shard maps everything to zero.
        assert_eq!(shard_of(&id, 1), 0);
    }

    #[test]
    fn test_shards_spread_ids() {
        let hits: std::collections::HashSet<usize> = (0..64)
            .map(|i| shard_of(&TaskId::new(format!("task-{}", i)), 4))
            .collect();
        assert!(hits.len() > 1);
    }

    #[test]
    fn test_backoff_doubles_with_bounded_jitter() {
        for retry in 0..5u32 {
            let base = 100u64;
            let expected = base * (1 << retry);
            for _ in 0..20 {
                let b = backoff_ms(base, retry);
                assert!(b >= expected, "backoff below exponential floor");
                assert!(b <= expected + expected / 4, "jitter above quarter bound");
            }
        }
    }

    #[test]
    fn test_provider_related_kinds() {
        assert!(ErrorKind::TransientProvider.is_provider_related());
        assert!(ErrorKind::PermanentProvider.is_provider_related());
        assert!(!ErrorKind::WorkerFault.is_provider_related());
        assert!(!ErrorKind::Validation.is_provider_related());
    }

    #[test]
    fn test_graph_error_mapping() {
        assert_eq!(
            map_graph_err(GraphError::Duplicate(TaskId::new("t"))),
            SubmitError::Duplicate(TaskId::new("t"))
        );
        assert_eq!(
            map_graph_err(GraphError::CycleDetected),
            SubmitError::CycleDetected
        );
        assert_eq!(
            map_graph_err(GraphError::UnknownPrereq(TaskId::new("p"))),
            SubmitError::UnknownPrereq(TaskId::new("p"))
        );
    }
}

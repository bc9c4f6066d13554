//! Recovery Manager
//!
//! Periodic checkpoints and crash-safe resumption. A checkpoint persists
//! the queue, edge list, worker identities, and provider status into the
//! KV, then captures a named store snapshot. Recovery loads the newest
//! valid snapshot, replays the log tail over it, and rebuilds transient
//! state: worker loads are cleared, and anything that was assigned or
//! running returns to ready with its retry count bumped.

use std::collections::HashMap;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use taskmesh_graph::DepGraph;
use taskmesh_store::{
    provider_key, task_key, worker_key, DurableStore, StoreError, KEY_GRAPH_EDGES, KEY_QUEUE,
};
use taskmesh_types::{
    Event, EventBody, ProviderStatus, TaskFailure, TaskId, TaskRecord, TaskState, WorkerId,
    WorkerRecord, WorkerState,
};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Store error during recovery: {0}")]
    Store(#[from] StoreError),

    #[error("Corrupt persisted record {key}: {detail}")]
    CorruptRecord { key: String, detail: String },
}

/// Engine state as reconstructed on startup.
pub struct RecoveredState {
    pub tasks: HashMap<TaskId, TaskRecord>,
    pub graph: DepGraph,
    /// Queue contents with their last persisted scores.
    pub queue: Vec<(TaskId, u64)>,
    pub workers: Vec<WorkerRecord>,
    pub providers: Vec<ProviderStatus>,
    pub last_seq: u64,
    /// Tasks returned from assigned/running to ready, retry count bumped.
    pub requeued: Vec<TaskId>,
    pub fresh_start: bool,
}

/// Everything a checkpoint persists besides the task records (those are
/// written by the scheduler on every transition).
pub struct CheckpointInput {
    pub edges: Vec<(TaskId, TaskId)>,
    pub queue: Vec<(TaskId, u64)>,
    pub workers: Vec<WorkerRecord>,
    pub providers: Vec<ProviderStatus>,
}

pub struct RecoveryManager {
    store: std::sync::Arc<DurableStore>,
}

impl RecoveryManager {
    pub fn new(store: std::sync::Arc<DurableStore>) -> Self {
        Self { store }
    }

    /// Write a checkpoint and capture a snapshot. Returns its name and the
    /// captured sequence.
    pub async fn checkpoint(&self, input: CheckpointInput) -> Result<(String, u64), StoreError> {
        self.store
            .put(KEY_QUEUE, &serde_json::to_vec(&input.queue)?)
            .await?;
        self.store
            .put(KEY_GRAPH_EDGES, &serde_json::to_vec(&input.edges)?)
            .await?;
        for worker in &input.workers {
            self.store
                .put(&worker_key(&worker.id), &serde_json::to_vec(worker)?)
                .await?;
        }
        for provider in &input.providers {
            self.store
                .put(&provider_key(&provider.id), &serde_json::to_vec(provider)?)
                .await?;
        }

        let nonce = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            &nonce[..8]
        );
        let seq = self.store.snapshot(&name).await?;
        info!(snapshot = %name, last_seq = seq, "Checkpoint written");
        Ok((name, seq))
    }

    /// Reconstruct engine state: newest valid snapshot, then log replay,
    /// then transient-state rebuild.
    pub async fn recover(&self) -> Result<RecoveredState, RecoveryError> {
        let mut tasks: HashMap<TaskId, TaskRecord> = HashMap::new();
        let mut workers: HashMap<WorkerId, WorkerRecord> = HashMap::new();
        let mut providers: HashMap<taskmesh_types::ProviderId, ProviderStatus> = HashMap::new();
        let mut queue: Vec<(TaskId, u64)> = Vec::new();

        let snapshot = self.store.load_latest_snapshot().await?;
        let replay_from = match &snapshot {
            Some((meta, data)) => {
                info!(snapshot = %meta.name, last_seq = meta.last_seq, "Restoring from snapshot");
                for (key, value) in &data.entries {
                    if let Some(id) = key.strip_prefix("task:") {
                        tasks.insert(TaskId::new(id), parse_record(key, value)?);
                    } else if key.starts_with("worker:") {
                        let record: WorkerRecord = parse_record(key, value)?;
                        workers.insert(record.id.clone(), record);
                    } else if key.starts_with("provider:") {
                        let status: ProviderStatus = parse_record(key, value)?;
                        providers.insert(status.id.clone(), status);
                    } else if key == KEY_QUEUE {
                        queue = parse_record(key, value)?;
                    }
                }
                data.last_seq + 1
            }
            None => 1,
        };

        let events = self.store.read_range(replay_from, u64::MAX).await?;
        let fresh_start = snapshot.is_none() && events.is_empty();
        if fresh_start {
            info!("No snapshot and empty log: starting fresh");
        } else if snapshot.is_none() {
            warn!(events = events.len(), "No usable snapshot; replaying full log");
        }

        let mut last_seq = replay_from.saturating_sub(1);
        for event in &events {
            last_seq = event.seq;
            self.apply(event, &mut tasks, &mut workers, &mut providers)
                .await?;
        }

        // Transient rebuild: in-flight work did not survive the crash.
        let now = Utc::now();
        let mut requeued = Vec::new();
        for record in tasks.values_mut() {
            if matches!(record.state, TaskState::Assigned | TaskState::Running) {
                record.state = TaskState::Ready;
                record.retry_count += 1;
                record.assigned_worker = None;
                record.assigned_provider = None;
                record.ready_at = Some(now);
                requeued.push(record.id.clone());
            }
        }
        requeued.sort();

        // Edges derive from the task records themselves, which carry their
        // prerequisite lists.
        let facts: Vec<_> = tasks
            .values()
            .map(|r| (r.id.clone(), r.state, r.estimated_ms, r.submitted_at))
            .collect();
        let edges: Vec<(TaskId, TaskId)> = tasks
            .values()
            .flat_map(|r| r.prereqs.iter().map(|p| (p.clone(), r.id.clone())))
            .collect();
        let graph = DepGraph::restore(facts, edges);

        // Queue: persisted entries that are still ready, plus any ready
        // task the checkpoint missed (scored by priority; the sweep
        // refreshes it).
        queue.retain(|(id, _)| tasks.get(id).map(|r| r.state) == Some(TaskState::Ready));
        for record in tasks.values() {
            if record.state == TaskState::Ready && !queue.iter().any(|(id, _)| id == &record.id) {
                queue.push((record.id.clone(), record.priority.base_score()));
            }
        }

        let mut workers: Vec<WorkerRecord> = workers.into_values().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        let mut providers: Vec<ProviderStatus> = providers.into_values().collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));

        info!(
            tasks = tasks.len(),
            requeued = requeued.len(),
            last_seq,
            "Recovery complete"
        );
        Ok(RecoveredState {
            tasks,
            graph,
            queue,
            workers,
            providers,
            last_seq,
            requeued,
            fresh_start,
        })
    }

    /// Fold one replayed event into the materialized state. Handlers are
    /// idempotent: applying the same event twice yields the same state.
    async fn apply(
        &self,
        event: &Event,
        tasks: &mut HashMap<TaskId, TaskRecord>,
        workers: &mut HashMap<WorkerId, WorkerRecord>,
        providers: &mut HashMap<taskmesh_types::ProviderId, ProviderStatus>,
    ) -> Result<(), RecoveryError> {
        match &event.body {
            EventBody::TaskSubmitted { task, .. } => {
                if !tasks.contains_key(task) {
                    // The submit-time record landed in the KV; it carries
                    // payload and policy fields the event body does not.
                    let key = task_key(task);
                    match self.store.get(&key).await? {
                        Some(bytes) => {
                            tasks.insert(task.clone(), parse_record(&key, &bytes)?);
                        }
                        None => warn!(task = %task, "Submitted task has no persisted record"),
                    }
                }
            }
            EventBody::TaskReady { task } => {
                if let Some(record) = tasks.get_mut(task) {
                    record.state = TaskState::Ready;
                    record.ready_at = Some(event.ts);
                    record.last_event_seq = event.seq;
                }
            }
            EventBody::TaskAssigned {
                task,
                worker,
                provider,
            } => {
                if let Some(record) = tasks.get_mut(task) {
                    record.state = TaskState::Assigned;
                    record.assigned_worker = Some(worker.clone());
                    record.assigned_provider = Some(provider.clone());
                    record.last_event_seq = event.seq;
                }
            }
            EventBody::TaskCompleted { task, .. } => {
                if let Some(record) = tasks.get_mut(task) {
                    record.state = TaskState::Succeeded;
                    record.last_event_seq = event.seq;
                }
            }
            EventBody::TaskFailed {
                task,
                error_kind,
                detail,
                terminal,
                ..
            } => {
                if let Some(record) = tasks.get_mut(task) {
                    record.last_failure = Some(TaskFailure::new(*error_kind, detail.clone()));
                    if *terminal {
                        record.state = TaskState::Failed;
                    }
                    record.last_event_seq = event.seq;
                }
            }
            EventBody::TaskRetried { task, retry_count, .. } => {
                if let Some(record) = tasks.get_mut(task) {
                    record.retry_count = *retry_count;
                    if !record.state.is_terminal() {
                        record.state = TaskState::Ready;
                        record.ready_at = Some(event.ts);
                    }
                    record.assigned_worker = None;
                    record.assigned_provider = None;
                    record.last_event_seq = event.seq;
                }
            }
            EventBody::TaskCancelled { task, cause } => {
                if let Some(record) = tasks.get_mut(task) {
                    record.state = TaskState::Cancelled;
                    record.cancel_cause = Some(cause.clone());
                    record.last_event_seq = event.seq;
                }
            }
            EventBody::WorkerJoined {
                worker,
                capabilities,
                concurrency,
            } => {
                workers.entry(worker.clone()).or_insert_with(|| WorkerRecord {
                    id: worker.clone(),
                    capabilities: capabilities.clone(),
                    concurrency: *concurrency,
                    state: WorkerState::Ready,
                    load: 0.0,
                    successes: 0,
                    failures: 0,
                    ewma_latency_ms: 0.0,
                    last_active: event.ts,
                    preferred_providers: vec![],
                });
            }
            EventBody::WorkerLeft { worker, .. } => {
                if let Some(record) = workers.get_mut(worker) {
                    record.state = WorkerState::Stopped;
                }
            }
            EventBody::ProviderOpened { provider } => {
                let status = providers
                    .entry(provider.clone())
                    .or_insert_with(|| ProviderStatus {
                        id: provider.clone(),
                        breaker: taskmesh_types::BreakerState::Closed,
                        tokens_consumed_today: 0,
                        requests: 0,
                        failures: 0,
                        window_failures: vec![],
                        ewma_latency_ms: 0.0,
                        last_reset: event.ts,
                        opened_at: None,
                    });
                status.breaker = taskmesh_types::BreakerState::Open;
                status.opened_at = Some(event.ts);
            }
            EventBody::ProviderClosed { provider } => {
                if let Some(status) = providers.get_mut(provider) {
                    status.breaker = taskmesh_types::BreakerState::Closed;
                    status.opened_at = None;
                }
            }
            EventBody::CheckpointWritten { .. } | EventBody::Alert { .. } => {}
        }
        Ok(())
    }
}

fn parse_record<T: serde::de::DeserializeOwned>(
    key: &str,
    bytes: &[u8],
) -> Result<T, RecoveryError> {
    serde_json::from_slice(bytes).map_err(|e| RecoveryError::CorruptRecord {
        key: key.to_string(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use taskmesh_types::{Department, Priority, ProviderId, TaskSpec};
    use tempfile::TempDir;

    fn spec(id: &str, prereqs: &[&str]) -> TaskSpec {
        TaskSpec {
            id: Some(TaskId::new(id)),
            kind: "summarize".into(),
            department: Department::Research,
            priority: Priority::High,
            payload: b"prompt".to_vec(),
            prereqs: prereqs.iter().map(|p| TaskId::new(*p)).collect(),
            max_retries: 3,
            deadline: None,
            estimated_ms: 1_000,
            capabilities: BTreeSet::new(),
            cost_mode: None,
        }
    }

    async fn submit(store: &DurableStore, id: &str, prereqs: &[&str]) -> TaskRecord {
        let record = TaskRecord::from_spec(TaskId::new(id), spec(id, prereqs), Utc::now());
        store
            .put(&task_key(&record.id), &serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();
        store
            .append(EventBody::TaskSubmitted {
                task: record.id.clone(),
                kind: record.kind.clone(),
                department: record.department,
                priority: record.priority,
                prereqs: record.prereqs.clone(),
            })
            .await
            .unwrap();
        record
    }

    #[tokio::test]
    async fn test_fresh_start_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DurableStore::open(dir.path()).await.unwrap());
        let recovery = RecoveryManager::new(store);
        let state = recovery.recover().await.unwrap();
        assert!(state.fresh_start);
        assert!(state.tasks.is_empty());
        assert_eq!(state.last_seq, 0);
    }

    #[tokio::test]
    async fn test_replay_without_snapshot_rebuilds_tasks() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DurableStore::open(dir.path()).await.unwrap());
        submit(&store, "t1", &[]).await;
        store
            .append(EventBody::TaskReady {
                task: TaskId::new("t1"),
            })
            .await
            .unwrap();

        let recovery = RecoveryManager::new(store);
        let state = recovery.recover().await.unwrap();
        assert!(!state.fresh_start);
        assert_eq!(state.tasks[&TaskId::new("t1")].state, TaskState::Ready);
        assert_eq!(state.queue.len(), 1);
        assert!(state.graph.contains(&TaskId::new("t1")));
    }

    #[tokio::test]
    async fn test_assigned_task_returns_to_ready_with_retry_bump() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DurableStore::open(dir.path()).await.unwrap());
        submit(&store, "t1", &[]).await;
        store
            .append(EventBody::TaskReady {
                task: TaskId::new("t1"),
            })
            .await
            .unwrap();
        store
            .append(EventBody::TaskAssigned {
                task: TaskId::new("t1"),
                worker: WorkerId::new("w1"),
                provider: ProviderId::new("p1"),
            })
            .await
            .unwrap();

        let recovery = RecoveryManager::new(store);
        let state = recovery.recover().await.unwrap();
        let record = &state.tasks[&TaskId::new("t1")];
        assert_eq!(record.state, TaskState::Ready);
        assert_eq!(record.retry_count, 1);
        assert!(record.assigned_worker.is_none());
        assert_eq!(state.requeued, vec![TaskId::new("t1")]);
        // No orphaned assignment: the task is queued again.
        assert!(state.queue.iter().any(|(id, _)| id == &TaskId::new("t1")));
    }

    #[tokio::test]
    async fn test_checkpoint_then_recover_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DurableStore::open(dir.path()).await.unwrap());
        let t1 = submit(&store, "t1", &[]).await;
        submit(&store, "t2", &["t1"]).await;
        store
            .append(EventBody::TaskReady {
                task: t1.id.clone(),
            })
            .await
            .unwrap();

        let recovery = RecoveryManager::new(store.clone());
        recovery
            .checkpoint(CheckpointInput {
                edges: vec![(TaskId::new("t1"), TaskId::new("t2"))],
                queue: vec![(TaskId::new("t1"), 100)],
                workers: vec![],
                providers: vec![],
            })
            .await
            .unwrap();

        // Succeed t1 after the checkpoint; replay must apply it.
        store
            .append(EventBody::TaskCompleted {
                task: t1.id.clone(),
                worker: WorkerId::new("w1"),
                provider: ProviderId::new("p1"),
                tokens_consumed: 10,
                latency_ms: 5,
            })
            .await
            .unwrap();
        // Keep the KV in line with the latest state, as the engine does.
        let mut done = t1.clone();
        done.state = TaskState::Succeeded;
        store
            .put(&task_key(&done.id), &serde_json::to_vec(&done).unwrap())
            .await
            .unwrap();

        let state = recovery.recover().await.unwrap();
        assert_eq!(state.tasks[&TaskId::new("t1")].state, TaskState::Succeeded);
        // t2's prerequisite is done but no ready event was logged; the
        // graph still reports it pending until the scheduler advances it.
        assert_eq!(state.tasks[&TaskId::new("t2")].state, TaskState::Pending);
        assert!(state.graph.contains(&TaskId::new("t2")));
    }

    #[tokio::test]
    async fn test_cancelled_cascade_replays() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DurableStore::open(dir.path()).await.unwrap());
        submit(&store, "t1", &[]).await;
        submit(&store, "t2", &["t1"]).await;
        store
            .append(EventBody::TaskFailed {
                task: TaskId::new("t1"),
                error_kind: taskmesh_types::ErrorKind::PermanentProvider,
                detail: "bad request".into(),
                provider: Some(ProviderId::new("p1")),
                terminal: true,
            })
            .await
            .unwrap();
        store
            .append(EventBody::TaskCancelled {
                task: TaskId::new("t2"),
                cause: "upstream failure".into(),
            })
            .await
            .unwrap();

        let recovery = RecoveryManager::new(store);
        let state = recovery.recover().await.unwrap();
        assert_eq!(state.tasks[&TaskId::new("t1")].state, TaskState::Failed);
        assert_eq!(state.tasks[&TaskId::new("t2")].state, TaskState::Cancelled);
        assert_eq!(
            state.tasks[&TaskId::new("t2")].cancel_cause.as_deref(),
            Some("upstream failure")
        );
    }
}

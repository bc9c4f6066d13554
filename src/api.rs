//! Submission API
//!
//! Transport-agnostic entry point. `EngineHandle` is a cheap cloneable
//! handle whose calls cross a command channel into the scheduler loop, so
//! callers never touch scheduler-owned state directly.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use taskmesh_types::{
    Department, Priority, TaskId, TaskRecord, TaskSpec, TaskState, WorkerId, WorkerRecord,
    WorkerSpec,
};

use crate::metrics::MetricsSnapshot;
use crate::pool::PoolError;
use crate::scheduler::Command;

/// Rejections surfaced to submitters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Task already exists: {0}")]
    Duplicate(TaskId),

    #[error("Unknown prerequisite: {0}")]
    UnknownPrereq(TaskId),

    #[error("Dependency would create a cycle")]
    CycleDetected,

    #[error("Invalid priority: {0}")]
    InvalidPriority(String),

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Engine is not running")]
    EngineStopped,
}

/// A submission as received from a caller. Priority arrives as a string
/// so malformed values surface as a typed rejection rather than a
/// deserialization error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub kind: String,
    pub department: Department,
    pub priority: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub prereqs: Vec<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_ms: u64,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub cost_mode: Option<String>,
}

impl SubmitRequest {
    /// Validate the request shape into a task spec. Graph-level checks
    /// (duplicates, unknown prereqs, cycles) happen inside the scheduler.
    pub fn into_spec(self, max_payload_bytes: usize) -> Result<TaskSpec, SubmitError> {
        let priority: Priority = self
            .priority
            .parse()
            .map_err(|_| SubmitError::InvalidPriority(self.priority.clone()))?;
        if self.payload.len() > max_payload_bytes {
            return Err(SubmitError::PayloadTooLarge {
                size: self.payload.len(),
                limit: max_payload_bytes,
            });
        }
        Ok(TaskSpec {
            id: self.id.map(TaskId::new),
            kind: self.kind,
            department: self.department,
            priority,
            payload: self.payload,
            prereqs: self.prereqs.into_iter().map(TaskId::new).collect(),
            max_retries: self.max_retries,
            deadline: self.deadline,
            estimated_ms: self.estimated_ms,
            capabilities: self.capabilities,
            cost_mode: self.cost_mode,
        })
    }
}

/// Filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub department: Option<Department>,
    pub kind: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, record: &TaskRecord) -> bool {
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        if let Some(department) = self.department {
            if record.department != department {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &record.kind != kind {
                return false;
            }
        }
        true
    }
}

/// Cloneable handle into the scheduler loop.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    async fn call<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SubmitError::EngineStopped)?;
        rx.await.map_err(|_| SubmitError::EngineStopped)
    }

    /// Submit a task. Returns its id or a typed rejection.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskId, SubmitError> {
        self.call(|reply| Command::Submit { request, reply }).await?
    }

    /// Cancel a task. Idempotent; returns the task's current state.
    pub async fn cancel(&self, id: impl Into<TaskId>) -> Result<TaskState, SubmitError> {
        let id = id.into();
        self.call(|reply| Command::Cancel { id, reply }).await?
    }

    /// Fetch one task record.
    pub async fn get(&self, id: impl Into<TaskId>) -> Result<Option<TaskRecord>, SubmitError> {
        let id = id.into();
        self.call(|reply| Command::Get { id, reply }).await
    }

    /// List task records matching a filter.
    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, SubmitError> {
        self.call(|reply| Command::List { filter, reply }).await
    }

    /// Register a worker with the pool.
    pub async fn register_worker(
        &self,
        spec: WorkerSpec,
    ) -> Result<Result<WorkerRecord, PoolError>, SubmitError> {
        self.call(|reply| Command::RegisterWorker { spec, reply }).await
    }

    /// Record a worker heartbeat.
    pub async fn heartbeat(&self, id: impl Into<WorkerId>) -> Result<(), SubmitError> {
        let id = id.into();
        self.commands
            .send(Command::Heartbeat { id })
            .await
            .map_err(|_| SubmitError::EngineStopped)
    }

    /// Drain a worker: it finishes current work and takes no more.
    pub async fn drain_worker(
        &self,
        id: impl Into<WorkerId>,
    ) -> Result<Result<(), PoolError>, SubmitError> {
        let id = id.into();
        self.call(|reply| Command::DrainWorker { id, reply }).await
    }

    /// Force a checkpoint now. Returns the snapshot name.
    pub async fn checkpoint(&self) -> Result<String, SubmitError> {
        self.call(|reply| Command::Checkpoint { reply }).await?
    }

    /// Current metrics rollups.
    pub async fn metrics(&self) -> Result<MetricsSnapshot, SubmitError> {
        self.call(|reply| Command::Metrics { reply }).await
    }

    /// Critical path through the unresolved graph.
    pub async fn critical_path(&self) -> Result<Vec<TaskId>, SubmitError> {
        self.call(|reply| Command::CriticalPath { reply }).await
    }

    /// Topological execution order, for planning display.
    pub async fn execution_order(&self) -> Result<Vec<TaskId>, SubmitError> {
        self.call(|reply| Command::ExecutionOrder { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(priority: &str) -> SubmitRequest {
        SubmitRequest {
            id: None,
            kind: "summarize".into(),
            department: Department::Research,
            priority: priority.into(),
            payload: vec![1, 2, 3],
            prereqs: vec![],
            max_retries: 0,
            deadline: None,
            estimated_ms: 0,
            capabilities: BTreeSet::new(),
            cost_mode: None,
        }
    }

    #[test]
    fn test_invalid_priority_rejected() {
        let err = request("urgent").into_spec(1024).unwrap_err();
        assert_eq!(err, SubmitError::InvalidPriority("urgent".into()));
    }

    #[test]
    fn test_payload_cap_enforced() {
        let mut req = request("normal");
        req.payload = vec![0; 2048];
        let err = req.into_spec(1024).unwrap_err();
        assert_eq!(
            err,
            SubmitError::PayloadTooLarge {
                size: 2048,
                limit: 1024
            }
        );
    }

    #[test]
    fn test_valid_request_converts() {
        let spec = request("critical").into_spec(1024).unwrap();
        assert_eq!(spec.priority, Priority::Critical);
        assert_eq!(spec.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_filter_matching() {
        let record = TaskRecord::from_spec(
            TaskId::new("t1"),
            request("normal").into_spec(1024).unwrap(),
            Utc::now(),
        );
        assert!(TaskFilter::default().matches(&record));
        assert!(TaskFilter {
            state: Some(TaskState::Ready),
            ..Default::default()
        }
        .matches(&record));
        assert!(!TaskFilter {
            state: Some(TaskState::Running),
            ..Default::default()
        }
        .matches(&record));
        assert!(!TaskFilter {
            kind: Some("translate".into()),
            ..Default::default()
        }
        .matches(&record));
    }
}

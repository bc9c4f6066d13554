//! Task Types
//!
//! The unit of work flowing through the engine: identity, priority,
//! dependencies, lifecycle state, and failure taxonomy.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::ProviderId;
use crate::worker::WorkerId;

/// Upper bound on the stored diagnostic trace of a failed task.
pub const MAX_ERROR_DETAIL: usize = 512;

/// Stable opaque task identity. Submitter-supplied or generated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id for submissions that did not supply one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Priority level of a task. Drives the base component of the queue score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Base score contribution for the composite queue ordering.
    pub fn base_score(&self) -> u64 {
        match self {
            Self::Critical => 1000,
            Self::High => 100,
            Self::Normal => 10,
            Self::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Department tag. Closed set: routing and per-department rollups key on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Department {
    Engineering,
    Research,
    Operations,
    Quality,
    Support,
}

impl Department {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Engineering => "engineering",
            Self::Research => "research",
            Self::Operations => "operations",
            Self::Quality => "quality",
            Self::Support => "support",
        }
    }
}

impl std::fmt::Display for Department {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Department {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "engineering" => Ok(Self::Engineering),
            "research" => Ok(Self::Research),
            "operations" => Ok(Self::Operations),
            "quality" => Ok(Self::Quality),
            "support" => Ok(Self::Support),
            _ => Err(format!("Unknown department: {}", s)),
        }
    }
}

/// Lifecycle state of a task. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Ready,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown task state: {}", s)),
        }
    }
}

/// Error taxonomy. Kinds, not types: the same kind may originate from
/// several concrete errors, and the retry policy keys on the kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed submission, cycle, unknown prereq. Never retried.
    Validation,
    /// No worker or provider available. Reported as state, not failure.
    Capacity,
    /// Timeout, rate-limit, connection reset. Retryable; feeds the breaker.
    TransientProvider,
    /// Bad-request, authentication. Non-retryable for that provider.
    PermanentProvider,
    /// Worker crash or heartbeat loss. Task retries elsewhere.
    WorkerFault,
    /// Append/snapshot failure. Fatal at system level.
    StoreFault,
    /// Snapshot checksum mismatch on load.
    Integrity,
}

impl ErrorKind {
    /// Whether a failure of this kind lets the task re-enter the queue
    /// (retries permitting).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientProvider | Self::WorkerFault)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Capacity => "capacity",
            Self::TransientProvider => "transient_provider",
            Self::PermanentProvider => "permanent_provider",
            Self::WorkerFault => "worker_fault",
            Self::StoreFault => "store_fault",
            Self::Integrity => "integrity",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Last failure recorded against a task. The detail is bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let mut detail = detail.into();
        if detail.len() > MAX_ERROR_DETAIL {
            let mut cut = MAX_ERROR_DETAIL;
            while !detail.is_char_boundary(cut) {
                cut -= 1;
            }
            detail.truncate(cut);
        }
        Self {
            kind,
            detail,
            at: Utc::now(),
        }
    }
}

/// A task as submitted. Identity is optional; the engine generates one
/// when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<TaskId>,
    /// Free-form work kind (e.g. "summarize", "code-review").
    pub kind: String,
    pub department: Department,
    pub priority: Priority,
    /// Opaque payload handed to the dispatch collaborator.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Prerequisite task ids. Empty means immediately ready.
    #[serde(default)]
    pub prereqs: Vec<TaskId>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Estimated duration in milliseconds; used for critical-path planning.
    #[serde(default)]
    pub estimated_ms: u64,
    /// Capability tags a worker/provider must carry to execute this task.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Named provider cost mode; the engine default applies when absent.
    #[serde(default)]
    pub cost_mode: Option<String>,
}

/// Full task record as persisted and returned by `get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: String,
    pub department: Department,
    pub priority: Priority,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
    /// When the task last became ready (unset while pending).
    pub ready_at: Option<DateTime<Utc>>,
    pub estimated_ms: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub payload: Vec<u8>,
    pub capabilities: BTreeSet<String>,
    pub prereqs: Vec<TaskId>,
    pub cost_mode: Option<String>,
    pub assigned_worker: Option<WorkerId>,
    pub assigned_provider: Option<ProviderId>,
    pub last_failure: Option<TaskFailure>,
    /// Cause recorded when the task was cancelled.
    pub cancel_cause: Option<String>,
    /// Sequence of the most recent event appended for this task.
    pub last_event_seq: u64,
}

impl TaskRecord {
    /// Build the initial record for an accepted submission.
    pub fn from_spec(id: TaskId, spec: TaskSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: spec.kind,
            department: spec.department,
            priority: spec.priority,
            state: if spec.prereqs.is_empty() {
                TaskState::Ready
            } else {
                TaskState::Pending
            },
            submitted_at: now,
            ready_at: if spec.prereqs.is_empty() {
                Some(now)
            } else {
                None
            },
            estimated_ms: spec.estimated_ms,
            retry_count: 0,
            max_retries: spec.max_retries,
            deadline: spec.deadline,
            payload: spec.payload,
            capabilities: spec.capabilities,
            prereqs: spec.prereqs,
            cost_mode: spec.cost_mode,
            assigned_worker: None,
            assigned_provider: None,
            last_failure: None,
            cancel_cause: None,
            last_event_seq: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a retryable failure may re-enter the queue.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

//! Event Types
//!
//! The durable vocabulary of the engine. Every domain transition appends
//! exactly one event; replaying the log from zero reproduces aggregate
//! state, so event bodies carry everything replay needs and nothing more.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::provider::ProviderId;
use crate::task::{Department, ErrorKind, Priority, TaskId};
use crate::worker::WorkerId;

/// Enumerated event type. The wire form is the dotted name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task.submitted")]
    TaskSubmitted,
    #[serde(rename = "task.ready")]
    TaskReady,
    #[serde(rename = "task.assigned")]
    TaskAssigned,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.retried")]
    TaskRetried,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
    #[serde(rename = "worker.joined")]
    WorkerJoined,
    #[serde(rename = "worker.left")]
    WorkerLeft,
    #[serde(rename = "provider.opened")]
    ProviderOpened,
    #[serde(rename = "provider.closed")]
    ProviderClosed,
    #[serde(rename = "checkpoint.written")]
    CheckpointWritten,
    #[serde(rename = "alert")]
    Alert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskSubmitted => "task.submitted",
            Self::TaskReady => "task.ready",
            Self::TaskAssigned => "task.assigned",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskRetried => "task.retried",
            Self::TaskCancelled => "task.cancelled",
            Self::WorkerJoined => "worker.joined",
            Self::WorkerLeft => "worker.left",
            Self::ProviderOpened => "provider.opened",
            Self::ProviderClosed => "provider.closed",
            Self::CheckpointWritten => "checkpoint.written",
            Self::Alert => "alert",
        }
    }

    /// Bus topic this kind publishes under: the segment before the dot.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::TaskSubmitted
            | Self::TaskReady
            | Self::TaskAssigned
            | Self::TaskCompleted
            | Self::TaskFailed
            | Self::TaskRetried
            | Self::TaskCancelled => "task",
            Self::WorkerJoined | Self::WorkerLeft => "worker",
            Self::ProviderOpened | Self::ProviderClosed => "provider",
            Self::CheckpointWritten => "checkpoint",
            Self::Alert => "alert",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Type-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventBody {
    TaskSubmitted {
        task: TaskId,
        kind: String,
        department: Department,
        priority: Priority,
        prereqs: Vec<TaskId>,
    },
    TaskReady {
        task: TaskId,
    },
    TaskAssigned {
        task: TaskId,
        worker: WorkerId,
        provider: ProviderId,
    },
    TaskCompleted {
        task: TaskId,
        worker: WorkerId,
        provider: ProviderId,
        tokens_consumed: u64,
        latency_ms: u64,
    },
    TaskFailed {
        task: TaskId,
        error_kind: ErrorKind,
        detail: String,
        /// Provider the failing attempt ran against, when one was assigned.
        provider: Option<ProviderId>,
        /// True when retries are exhausted or the kind is non-retryable.
        terminal: bool,
    },
    TaskRetried {
        task: TaskId,
        retry_count: u32,
        backoff_ms: u64,
    },
    TaskCancelled {
        task: TaskId,
        cause: String,
    },
    WorkerJoined {
        worker: WorkerId,
        capabilities: BTreeSet<String>,
        concurrency: u32,
    },
    WorkerLeft {
        worker: WorkerId,
        reason: String,
    },
    ProviderOpened {
        provider: ProviderId,
    },
    ProviderClosed {
        provider: ProviderId,
    },
    CheckpointWritten {
        snapshot: String,
        last_seq: u64,
    },
    Alert {
        code: String,
        message: String,
    },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TaskSubmitted { .. } => EventKind::TaskSubmitted,
            Self::TaskReady { .. } => EventKind::TaskReady,
            Self::TaskAssigned { .. } => EventKind::TaskAssigned,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::TaskRetried { .. } => EventKind::TaskRetried,
            Self::TaskCancelled { .. } => EventKind::TaskCancelled,
            Self::WorkerJoined { .. } => EventKind::WorkerJoined,
            Self::WorkerLeft { .. } => EventKind::WorkerLeft,
            Self::ProviderOpened { .. } => EventKind::ProviderOpened,
            Self::ProviderClosed { .. } => EventKind::ProviderClosed,
            Self::CheckpointWritten { .. } => EventKind::CheckpointWritten,
            Self::Alert { .. } => EventKind::Alert,
        }
    }

    /// Task id this event concerns, when it concerns one.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskSubmitted { task, .. }
            | Self::TaskReady { task }
            | Self::TaskAssigned { task, .. }
            | Self::TaskCompleted { task, .. }
            | Self::TaskFailed { task, .. }
            | Self::TaskRetried { task, .. }
            | Self::TaskCancelled { task, .. } => Some(task),
            _ => None,
        }
    }
}

/// A durable log record. `seq` is assigned by the store on append; bus-only
/// events (alerts, drop notices) carry seq 0 and are never in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub body: EventBody,
}

impl Event {
    /// Build an unsequenced event; the store stamps `seq` on append.
    pub fn new(body: EventBody) -> Self {
        Self {
            seq: 0,
            ts: Utc::now(),
            kind: body.kind(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(EventKind::TaskSubmitted.as_str(), "task.submitted");
        assert_eq!(EventKind::CheckpointWritten.as_str(), "checkpoint.written");
        let json = serde_json::to_string(&EventKind::ProviderOpened).unwrap();
        assert_eq!(json, "\"provider.opened\"");
    }

    #[test]
    fn test_body_kind_agreement() {
        let body = EventBody::TaskReady {
            task: TaskId::new("t1"),
        };
        assert_eq!(body.kind(), EventKind::TaskReady);
        let event = Event::new(body);
        assert_eq!(event.kind, EventKind::TaskReady);
        assert_eq!(event.seq, 0);
    }

    #[test]
    fn test_topics() {
        assert_eq!(EventKind::TaskFailed.topic(), "task");
        assert_eq!(EventKind::WorkerJoined.topic(), "worker");
        assert_eq!(EventKind::ProviderClosed.topic(), "provider");
        assert_eq!(EventKind::CheckpointWritten.topic(), "checkpoint");
    }

    #[test]
    fn test_event_json_round_trip() {
        let event = Event {
            seq: 42,
            ts: Utc::now(),
            kind: EventKind::TaskAssigned,
            body: EventBody::TaskAssigned {
                task: TaskId::new("t1"),
                worker: WorkerId::new("w1"),
                provider: ProviderId::new("p1"),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_task_id_extraction() {
        let body = EventBody::TaskCancelled {
            task: TaskId::new("t9"),
            cause: "upstream failure".to_string(),
        };
        assert_eq!(body.task_id(), Some(&TaskId::new("t9")));

        let body = EventBody::WorkerLeft {
            worker: WorkerId::new("w1"),
            reason: "heartbeat timeout".to_string(),
        };
        assert!(body.task_id().is_none());
    }
}

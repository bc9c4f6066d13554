//! Worker Types
//!
//! An executor slot: capability set, concurrency limit, load accounting,
//! and the lease token handed out by the pool on reservation.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::ProviderId;

/// Worker identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Worker lifecycle state. Draining workers accept no new assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Idle,
    Draining,
    Stopped,
}

impl WorkerState {
    /// Whether the pool may hand new work to a worker in this state.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Ready | Self::Idle | Self::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registration request for a new worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    #[serde(default)]
    pub id: Option<WorkerId>,
    /// Kind/department tags this worker accepts.
    pub capabilities: BTreeSet<String>,
    pub concurrency: u32,
    /// Provider preference ordering, most preferred first.
    #[serde(default)]
    pub preferred_providers: Vec<ProviderId>,
}

/// Full worker record as tracked by the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub capabilities: BTreeSet<String>,
    pub concurrency: u32,
    pub state: WorkerState,
    /// Fraction of concurrency in use, in [0, 1].
    pub load: f64,
    pub successes: u64,
    pub failures: u64,
    /// Exponentially weighted average completion latency.
    pub ewma_latency_ms: f64,
    pub last_active: DateTime<Utc>,
    pub preferred_providers: Vec<ProviderId>,
}

impl WorkerRecord {
    pub fn from_spec(id: WorkerId, spec: WorkerSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            capabilities: spec.capabilities,
            concurrency: spec.concurrency.max(1),
            state: WorkerState::Starting,
            load: 0.0,
            successes: 0,
            failures: 0,
            ewma_latency_ms: 0.0,
            last_active: now,
            preferred_providers: spec.preferred_providers,
        }
    }

    /// Success fraction over all completed work; 1.0 before any outcome.
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }

    /// Whether this worker can take on the given capability requirements.
    pub fn can_execute(&self, required: &BTreeSet<String>) -> bool {
        self.state.accepts_work() && required.is_subset(&self.capabilities)
    }

    /// Load delta contributed by one reservation.
    pub fn load_step(&self) -> f64 {
        1.0 / self.concurrency as f64
    }

    /// Whether one more reservation fits under the concurrency limit.
    pub fn has_free_slot(&self) -> bool {
        // Half a slot of tolerance absorbs float accumulation drift.
        self.load + self.load_step() <= 1.0 + self.load_step() / 2.0
    }
}

/// Token returned by a successful reservation. Must be presented on release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub lease_id: Uuid,
    pub worker: WorkerId,
    pub issued_at: DateTime<Utc>,
}

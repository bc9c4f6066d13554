//! Shared domain types for the taskmesh scheduling engine.
//!
//! Everything durable or crossing a component boundary lives here: task and
//! worker records, provider configuration, the event vocabulary, and the
//! error-kind taxonomy. The engine crates depend on this one and never on
//! each other's internals.

pub mod event;
pub mod provider;
pub mod task;
pub mod worker;

pub use event::{Event, EventBody, EventKind};
pub use provider::{
    BreakerPolicy, BreakerState, CostMode, PriorityClass, ProviderConfig, ProviderId, ProviderKind,
    ProviderStatus,
};
pub use task::{
    Department, ErrorKind, Priority, TaskFailure, TaskId, TaskRecord, TaskSpec, TaskState,
};
pub use worker::{LeaseToken, WorkerId, WorkerRecord, WorkerSpec, WorkerState};

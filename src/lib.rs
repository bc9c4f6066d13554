//! taskmesh
//!
//! Task scheduling and routing engine for LLM-backed agent fleets: a
//! DAG-aware priority scheduler that routes work to a pool of typed
//! workers across external model providers, under per-provider quotas and
//! circuit breakers, with an event-sourced durable store for crash
//! recovery.
//!
//! The crate exposes the engine as a library; `meshd` wraps it in a
//! daemon. Front-ends (HTTP, CLI, dashboards) live elsewhere and talk to
//! `EngineHandle`.

pub mod api;
pub mod bus;
pub mod config;
pub mod metrics;
pub mod pool;
pub mod providers;
pub mod queue;
pub mod recovery;
pub mod scheduler;

pub use api::{EngineHandle, SubmitError, SubmitRequest, TaskFilter};
pub use config::{ConfigError, MeshConfig, ProvidersFile};
pub use scheduler::{BootError, Engine, EngineRuntime, SchedulerError};

pub use taskmesh_dispatch as dispatch;
pub use taskmesh_graph as graph;
pub use taskmesh_store as store;
pub use taskmesh_types as types;

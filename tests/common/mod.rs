//! Shared harness for engine integration tests: a fast-ticking config,
//! canned providers, and polling helpers over the public handle.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use taskmesh::dispatch::ScriptedDispatcher;
use taskmesh::types::{
    BreakerPolicy, Department, Event, PriorityClass, ProviderConfig, ProviderId, ProviderKind,
    TaskId, TaskRecord, TaskState, WorkerId, WorkerSpec,
};
use taskmesh::{Engine, EngineHandle, EngineRuntime, MeshConfig, ProvidersFile, SubmitRequest};

pub fn test_config(dir: &Path) -> MeshConfig {
    MeshConfig {
        data_dir: dir.to_path_buf(),
        tick_interval_ms: 20,
        retry_base_delay_ms: 100,
        snapshot_interval_ms: 0,
        cancel_grace_ms: 1_000,
        dispatch_timeout_ms: 10_000,
        heartbeat_timeout_ms: 60_000,
        ..Default::default()
    }
}

pub fn provider(id: &str, cost: f64, threshold: u32, cooldown_ms: u64) -> ProviderConfig {
    ProviderConfig {
        id: ProviderId::new(id),
        kind: ProviderKind::OpenAi,
        endpoint: "http://localhost:0".to_string(),
        model: None,
        cost_per_1k_tokens: cost,
        daily_token_budget: 1_000_000,
        breaker: BreakerPolicy {
            consecutive_failures: threshold,
            window_ms: 60_000,
            cooldown_ms,
        },
        capabilities: Default::default(),
        class: PriorityClass::Balanced,
    }
}

pub fn providers_file(providers: Vec<ProviderConfig>) -> ProvidersFile {
    ProvidersFile {
        providers,
        modes: BTreeMap::new(),
    }
}

pub fn worker(id: &str, concurrency: u32) -> WorkerSpec {
    WorkerSpec {
        id: Some(WorkerId::new(id)),
        capabilities: Default::default(),
        concurrency,
        preferred_providers: vec![],
    }
}

pub fn request(id: &str, priority: &str, prereqs: &[&str]) -> SubmitRequest {
    SubmitRequest {
        id: Some(id.to_string()),
        kind: "summarize".to_string(),
        department: Department::Research,
        priority: priority.to_string(),
        payload: format!("work for {}", id).into_bytes(),
        prereqs: prereqs.iter().map(|p| p.to_string()).collect(),
        max_retries: 3,
        deadline: None,
        estimated_ms: 1_000,
        capabilities: Default::default(),
        cost_mode: None,
    }
}

pub async fn start_engine(
    dir: &Path,
    providers: Vec<ProviderConfig>,
    dispatcher: ScriptedDispatcher,
) -> (EngineRuntime, ScriptedDispatcher) {
    start_engine_with(test_config(dir), providers, dispatcher).await
}

pub async fn start_engine_with(
    config: MeshConfig,
    providers: Vec<ProviderConfig>,
    dispatcher: ScriptedDispatcher,
) -> (EngineRuntime, ScriptedDispatcher) {
    let runtime = Engine::start(
        config,
        providers_file(providers),
        std::sync::Arc::new(dispatcher.clone()),
    )
    .await
    .expect("engine start");
    (runtime, dispatcher)
}

/// Poll `get` until the task reaches `state` or the timeout elapses.
pub async fn await_state(
    handle: &EngineHandle,
    id: &str,
    state: TaskState,
    timeout: Duration,
) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(record) = handle.get(id).await.expect("engine alive") {
            if record.state == state {
                return record;
            }
            assert!(
                !(record.state.is_terminal() && record.state != state),
                "task {} settled as {} while waiting for {}",
                id,
                record.state,
                state
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for task {} to reach {}",
            id,
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the task is in any of the given states.
pub async fn await_any_state(
    handle: &EngineHandle,
    id: &str,
    states: &[TaskState],
    timeout: Duration,
) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(record) = handle.get(id).await.expect("engine alive") {
            if states.contains(&record.state) {
                return record;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for task {} to reach one of {:?}",
            id,
            states
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The full durable log, oldest first.
pub async fn events(runtime: &EngineRuntime) -> Vec<Event> {
    runtime
        .store
        .read_range(1, u64::MAX)
        .await
        .expect("log readable")
}

/// (kind, task-id) pairs for task-scoped events, in log order.
pub fn task_events(events: &[Event]) -> Vec<(String, String)> {
    events
        .iter()
        .filter(|e| e.kind.topic() == "task")
        .filter_map(|e| {
            e.body
                .task_id()
                .map(|t| (e.kind.as_str().to_string(), t.as_str().to_string()))
        })
        .collect()
}

/// Log entries of one kind concerning one task.
pub fn count_events(events: &[Event], kind: &str, task: &str) -> usize {
    task_events(events)
        .iter()
        .filter(|(k, t)| k == kind && t == task)
        .count()
}

pub fn tid(s: &str) -> TaskId {
    TaskId::new(s)
}

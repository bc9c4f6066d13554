//! End-to-end scheduling scenarios against the scripted dispatcher.

mod common;

use std::time::Duration;

use taskmesh::dispatch::{ScriptStep, ScriptedDispatcher};
use taskmesh::types::{ErrorKind, ProviderId, TaskState};
use taskmesh::{MeshConfig, SubmitError, TaskFilter};
use tempfile::TempDir;

use common::*;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_linear_chain_event_order() {
    let dir = TempDir::new().unwrap();
    // A slow tick keeps the whole submission burst ahead of the first
    // readiness pass, making the event order deterministic.
    let config = MeshConfig {
        tick_interval_ms: 100,
        ..test_config(dir.path())
    };
    let (runtime, _) = start_engine_with(
        config,
        vec![provider("p1", 1.0, 5, 1_000)],
        ScriptedDispatcher::new(),
    )
    .await;
    let handle = runtime.handle.clone();

    handle
        .register_worker(worker("w1", 1))
        .await
        .unwrap()
        .unwrap();
    handle.submit(request("T1", "high", &[])).await.unwrap();
    handle.submit(request("T2", "high", &["T1"])).await.unwrap();
    handle.submit(request("T3", "high", &["T2"])).await.unwrap();

    await_state(&handle, "T3", TaskState::Succeeded, WAIT).await;
    assert_eq!(
        await_state(&handle, "T1", TaskState::Succeeded, WAIT)
            .await
            .state,
        TaskState::Succeeded
    );
    await_state(&handle, "T2", TaskState::Succeeded, WAIT).await;

    let log = events(&runtime).await;
    let expected: Vec<(String, String)> = [
        ("task.submitted", "T1"),
        ("task.submitted", "T2"),
        ("task.submitted", "T3"),
        ("task.ready", "T1"),
        ("task.assigned", "T1"),
        ("task.completed", "T1"),
        ("task.ready", "T2"),
        ("task.assigned", "T2"),
        ("task.completed", "T2"),
        ("task.ready", "T3"),
        ("task.assigned", "T3"),
        ("task.completed", "T3"),
    ]
    .iter()
    .map(|(k, t)| (k.to_string(), t.to_string()))
    .collect();
    assert_eq!(task_events(&log), expected);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_submission_rejections() {
    let dir = TempDir::new().unwrap();
    let (runtime, _) = start_engine(
        dir.path(),
        vec![provider("p1", 1.0, 5, 1_000)],
        ScriptedDispatcher::new(),
    )
    .await;
    let handle = runtime.handle.clone();

    handle.submit(request("T1", "normal", &[])).await.unwrap();

    // Duplicate id.
    let err = handle.submit(request("T1", "normal", &[])).await.unwrap_err();
    assert_eq!(err, SubmitError::Duplicate(tid("T1")));

    // Unknown prerequisite.
    let err = handle
        .submit(request("T2", "normal", &["ghost"]))
        .await
        .unwrap_err();
    assert_eq!(err, SubmitError::UnknownPrereq(tid("ghost")));

    // Invalid priority string.
    let err = handle
        .submit(request("T3", "urgent", &[]))
        .await
        .unwrap_err();
    assert_eq!(err, SubmitError::InvalidPriority("urgent".into()));

    // Oversized payload.
    let mut big = request("T4", "normal", &[]);
    big.payload = vec![0u8; 2 * 1024 * 1024];
    let err = handle.submit(big).await.unwrap_err();
    assert!(matches!(err, SubmitError::PayloadTooLarge { .. }));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_breaker_opens_after_threshold_and_probes_back() {
    let dir = TempDir::new().unwrap();
    let dispatcher = ScriptedDispatcher::new();
    // Provider A fails three times, then behaves. B always works.
    dispatcher.script(
        "pA",
        vec![
            ScriptStep::fail(ErrorKind::TransientProvider, "connection reset"),
            ScriptStep::fail(ErrorKind::TransientProvider, "connection reset"),
            ScriptStep::fail(ErrorKind::TransientProvider, "connection reset"),
        ],
    );
    let (runtime, dispatcher) = start_engine(
        dir.path(),
        vec![
            provider("pA", 1.0, 3, 400),
            provider("pB", 5.0, 3, 400),
        ],
        dispatcher,
    )
    .await;
    let handle = runtime.handle.clone();

    handle
        .register_worker(worker("w1", 1))
        .await
        .unwrap()
        .unwrap();
    for i in 1..=5 {
        handle
            .submit(request(&format!("T{}", i), "normal", &[]))
            .await
            .unwrap();
    }
    for i in 1..=5 {
        await_state(&handle, &format!("T{}", i), TaskState::Succeeded, WAIT).await;
    }

    // Three failures tripped the breaker; everything after went to B.
    assert_eq!(dispatcher.calls_for(&ProviderId::new("pA")), 3);
    let log = events(&runtime).await;
    assert!(log.iter().any(|e| e.kind.as_str() == "provider.opened"));

    // After the cooldown, the cheaper provider is probed again and the
    // probe's success closes the breaker.
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.submit(request("T6", "normal", &[])).await.unwrap();
    await_state(&handle, "T6", TaskState::Succeeded, WAIT).await;

    assert_eq!(dispatcher.calls_for(&ProviderId::new("pA")), 4);
    let log = events(&runtime).await;
    assert!(log.iter().any(|e| e.kind.as_str() == "provider.closed"));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_running_task_cascades_to_dependents() {
    let dir = TempDir::new().unwrap();
    let dispatcher = ScriptedDispatcher::new();
    dispatcher.script("p1", vec![ScriptStep::Hang]);
    let (runtime, _) =
        start_engine(dir.path(), vec![provider("p1", 1.0, 5, 1_000)], dispatcher).await;
    let handle = runtime.handle.clone();

    handle
        .register_worker(worker("w1", 1))
        .await
        .unwrap()
        .unwrap();
    handle.submit(request("T1", "normal", &[])).await.unwrap();
    handle.submit(request("T2", "normal", &["T1"])).await.unwrap();
    handle.submit(request("T3", "normal", &["T2"])).await.unwrap();

    await_state(&handle, "T1", TaskState::Running, WAIT).await;
    handle.cancel("T1").await.unwrap();

    let t1 = await_state(&handle, "T1", TaskState::Cancelled, WAIT).await;
    assert_eq!(t1.cancel_cause.as_deref(), Some("cancelled by request"));

    let t2 = await_state(&handle, "T2", TaskState::Cancelled, WAIT).await;
    assert_eq!(t2.cancel_cause.as_deref(), Some("upstream failure"));
    let t3 = await_state(&handle, "T3", TaskState::Cancelled, WAIT).await;
    assert_eq!(t3.cancel_cause.as_deref(), Some("upstream failure"));

    // Dependents never became ready or assigned.
    let log = events(&runtime).await;
    for t in ["T2", "T3"] {
        assert_eq!(count_events(&log, "task.ready", t), 0);
        assert_eq!(count_events(&log, "task.assigned", t), 0);
    }

    // Cancelling again is a no-op that reports the terminal state.
    assert_eq!(handle.cancel("T1").await.unwrap(), TaskState::Cancelled);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_priority_order_with_single_slot() {
    let dir = TempDir::new().unwrap();
    let dispatcher = ScriptedDispatcher::new();
    dispatcher.script(
        "p1",
        vec![
            ScriptStep::succeed_after(Duration::from_millis(5)),
            ScriptStep::succeed_after(Duration::from_millis(5)),
            ScriptStep::succeed_after(Duration::from_millis(5)),
            ScriptStep::succeed_after(Duration::from_millis(5)),
        ],
    );
    let config = MeshConfig {
        tick_interval_ms: 100,
        ..test_config(dir.path())
    };
    let (runtime, dispatcher) =
        start_engine_with(config, vec![provider("p1", 1.0, 5, 1_000)], dispatcher).await;
    let handle = runtime.handle.clone();

    handle
        .register_worker(worker("w1", 1))
        .await
        .unwrap()
        .unwrap();
    // Insertion order is worst-first; dispatch must follow priority.
    handle.submit(request("L", "low", &[])).await.unwrap();
    handle.submit(request("N", "normal", &[])).await.unwrap();
    handle.submit(request("H", "high", &[])).await.unwrap();
    handle.submit(request("C", "critical", &[])).await.unwrap();

    for id in ["L", "N", "H", "C"] {
        await_state(&handle, id, TaskState::Succeeded, WAIT).await;
    }

    let order: Vec<String> = dispatcher
        .calls()
        .into_iter()
        .map(|c| c.task.as_str().to_string())
        .collect();
    assert_eq!(order, vec!["C", "H", "N", "L"]);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_against_another_provider_after_permanent_error() {
    let dir = TempDir::new().unwrap();
    let dispatcher = ScriptedDispatcher::new();
    // Cheap provider rejects the request outright; its breaker opens on
    // the first failure and the task retries elsewhere.
    dispatcher.script(
        "cheap",
        vec![ScriptStep::fail(ErrorKind::PermanentProvider, "bad request")],
    );
    let (runtime, dispatcher) = start_engine(
        dir.path(),
        vec![
            provider("cheap", 1.0, 1, 60_000),
            provider("backup", 9.0, 3, 1_000),
        ],
        dispatcher,
    )
    .await;
    let handle = runtime.handle.clone();

    handle
        .register_worker(worker("w1", 1))
        .await
        .unwrap()
        .unwrap();
    handle.submit(request("T1", "normal", &[])).await.unwrap();

    let record = await_state(&handle, "T1", TaskState::Succeeded, WAIT).await;
    assert_eq!(record.retry_count, 1);
    assert_eq!(dispatcher.calls_for(&ProviderId::new("cheap")), 1);
    // The failing attempt is on the record.
    let failure = record.last_failure.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::PermanentProvider);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_no_provider_leaves_tasks_ready_then_resumes() {
    let dir = TempDir::new().unwrap();
    let dispatcher = ScriptedDispatcher::new();
    // Single provider trips on the first failure, cooldown 300ms.
    dispatcher.script(
        "only",
        vec![ScriptStep::fail(ErrorKind::TransientProvider, "timeout")],
    );
    let (runtime, _) =
        start_engine(dir.path(), vec![provider("only", 1.0, 1, 300)], dispatcher).await;
    let handle = runtime.handle.clone();

    handle
        .register_worker(worker("w1", 1))
        .await
        .unwrap()
        .unwrap();
    handle.submit(request("T1", "normal", &[])).await.unwrap();
    handle.submit(request("T2", "normal", &[])).await.unwrap();

    // Give the breaker time to open; whichever task failed is waiting on
    // its backoff and the other is parked ready.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let ready_or_waiting = handle
        .list(TaskFilter {
            state: Some(TaskState::Ready),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!ready_or_waiting.is_empty(), "tasks should be parked ready");
    // No reservation persists while the only provider is open.
    let log = events(&runtime).await;
    let assigned_so_far = count_events(&log, "task.assigned", "T1")
        + count_events(&log, "task.assigned", "T2");
    assert!(assigned_so_far <= 1, "only the tripping attempt may have assigned");

    // Cooldown elapses, the probe succeeds, and both tasks finish exactly
    // once.
    await_state(&handle, "T1", TaskState::Succeeded, WAIT).await;
    await_state(&handle, "T2", TaskState::Succeeded, WAIT).await;
    let log = events(&runtime).await;
    assert_eq!(count_events(&log, "task.completed", "T1"), 1);
    assert_eq!(count_events(&log, "task.completed", "T2"), 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_graph_emits_nothing() {
    let dir = TempDir::new().unwrap();
    let (runtime, _) = start_engine(
        dir.path(),
        vec![provider("p1", 1.0, 5, 1_000)],
        ScriptedDispatcher::new(),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(runtime.store.last_seq().await, 0);
    assert!(runtime.is_running());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_submit_then_get_round_trips_fields() {
    let dir = TempDir::new().unwrap();
    let (runtime, _) = start_engine(
        dir.path(),
        vec![provider("p1", 1.0, 5, 1_000)],
        ScriptedDispatcher::new(),
    )
    .await;
    let handle = runtime.handle.clone();

    let mut req = request("T1", "high", &[]);
    req.estimated_ms = 7_500;
    req.max_retries = 2;
    handle.submit(req).await.unwrap();

    let record = handle.get("T1").await.unwrap().expect("record exists");
    assert_eq!(record.kind, "summarize");
    assert_eq!(record.priority.as_str(), "high");
    assert_eq!(record.estimated_ms, 7_500);
    assert_eq!(record.max_retries, 2);
    assert_eq!(record.payload, b"work for T1".to_vec());

    runtime.shutdown().await.unwrap();
}

//! Scripted Dispatcher
//!
//! In-memory dispatcher for tests and local runs. Each provider carries a
//! queue of scripted steps; when the queue is empty the dispatcher
//! defaults to instant success. Calls are recorded for assertions.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskmesh_types::{ErrorKind, ProviderId, TaskId, WorkerId};

use crate::{DispatchRequest, DispatchResult, Dispatcher};

/// One scripted behavior, consumed in order per provider.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Succeed {
        tokens: u64,
        latency_ms: u64,
        delay: Duration,
    },
    Fail {
        kind: ErrorKind,
        detail: String,
        delay: Duration,
    },
    /// Never completes on its own; the caller's deadline or cancellation
    /// ends it.
    Hang,
}

impl ScriptStep {
    pub fn succeed() -> Self {
        Self::Succeed {
            tokens: 100,
            latency_ms: 5,
            delay: Duration::ZERO,
        }
    }

    pub fn succeed_after(delay: Duration) -> Self {
        Self::Succeed {
            tokens: 100,
            latency_ms: delay.as_millis() as u64,
            delay,
        }
    }

    pub fn fail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Fail {
            kind,
            detail: detail.into(),
            delay: Duration::ZERO,
        }
    }
}

/// A recorded dispatch call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub task: TaskId,
    pub worker: WorkerId,
    pub provider: ProviderId,
}

#[derive(Default)]
struct ScriptState {
    scripts: HashMap<ProviderId, VecDeque<ScriptStep>>,
    calls: Vec<RecordedCall>,
}

/// Deterministic dispatcher driven by per-provider scripts.
#[derive(Clone, Default)]
pub struct ScriptedDispatcher {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue steps for a provider. Steps are consumed one per dispatch.
    pub fn script(&self, provider: impl Into<ProviderId>, steps: Vec<ScriptStep>) {
        let mut state = self.state.lock().expect("script lock");
        state
            .scripts
            .entry(provider.into())
            .or_default()
            .extend(steps);
    }

    /// All calls observed so far, in dispatch order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().expect("script lock").calls.clone()
    }

    /// Number of calls routed to one provider.
    pub fn calls_for(&self, provider: &ProviderId) -> usize {
        self.state
            .lock()
            .expect("script lock")
            .calls
            .iter()
            .filter(|c| &c.provider == provider)
            .count()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn execute(&self, request: &DispatchRequest) -> DispatchResult {
        let step = {
            let mut state = self.state.lock().expect("script lock");
            state.calls.push(RecordedCall {
                task: request.task.clone(),
                worker: request.worker.clone(),
                provider: request.provider.clone(),
            });
            state
                .scripts
                .get_mut(&request.provider)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(ScriptStep::succeed)
        };

        match step {
            ScriptStep::Succeed {
                tokens,
                latency_ms,
                delay,
            } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                DispatchResult::Succeeded {
                    tokens_consumed: tokens,
                    latency_ms,
                }
            }
            ScriptStep::Fail {
                kind,
                detail,
                delay,
            } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                DispatchResult::Failed { kind, detail }
            }
            ScriptStep::Hang => {
                // Effectively forever; the scheduler's deadline or cancel
                // path is what ends this.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                DispatchResult::Failed {
                    kind: ErrorKind::TransientProvider,
                    detail: "hang elapsed".to_string(),
                }
            }
        }
    }
}

//! Provider Dispatch
//!
//! The outbound edge of the engine: clients that talk to external LLM
//! providers and the `Dispatcher` trait the scheduler hands assignments
//! to. Dispatch implementations perform the provider request only; the
//! scheduler layers deadline and cancellation around every call.

mod anthropic;
mod factory;
mod llm_client;
mod openai;
mod scripted;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use taskmesh_types::{ErrorKind, ProviderConfig, ProviderId, TaskId, WorkerId};

pub use anthropic::AnthropicClient;
pub use factory::build_client;
pub use llm_client::{ClientError, Completion, LlmClient};
pub use openai::OpenAiClient;
pub use scripted::{RecordedCall, ScriptStep, ScriptedDispatcher};

/// One assignment handed to a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub task: TaskId,
    /// Work kind, forwarded so dispatchers can shape the prompt.
    pub kind: String,
    /// Opaque task payload; LLM dispatch interprets it as the user prompt.
    pub payload: Vec<u8>,
    pub worker: WorkerId,
    pub provider: ProviderId,
    pub deadline: DateTime<Utc>,
}

/// Terminal result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    Succeeded {
        tokens_consumed: u64,
        latency_ms: u64,
    },
    Failed {
        kind: ErrorKind,
        detail: String,
    },
}

/// Executes assignments against a provider. Implementations must return
/// exactly one result per call and never panic across the boundary.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn execute(&self, request: &DispatchRequest) -> DispatchResult;
}

/// Dispatcher backed by real LLM clients, one per configured provider.
pub struct LlmDispatcher {
    clients: HashMap<ProviderId, Arc<dyn LlmClient>>,
}

impl LlmDispatcher {
    /// Build clients for every configured provider. Fails when an API key
    /// for a configured kind is missing.
    pub fn new(providers: &[ProviderConfig]) -> Result<Self, ClientError> {
        let mut clients = HashMap::new();
        for cfg in providers {
            clients.insert(cfg.id.clone(), build_client(cfg)?);
        }
        Ok(Self { clients })
    }
}

#[async_trait]
impl Dispatcher for LlmDispatcher {
    async fn execute(&self, request: &DispatchRequest) -> DispatchResult {
        let Some(client) = self.clients.get(&request.provider) else {
            return DispatchResult::Failed {
                kind: ErrorKind::Capacity,
                detail: format!("no client configured for provider {}", request.provider),
            };
        };

        let system = format!(
            "You are a {} worker in an agent fleet. Complete the task and reply with the result only.",
            request.kind
        );
        let user = String::from_utf8_lossy(&request.payload).into_owned();

        let started = Instant::now();
        match client.complete(&system, &user).await {
            Ok(completion) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(
                    task = %request.task,
                    provider = %request.provider,
                    tokens = completion.tokens,
                    latency_ms,
                    "Dispatch completed"
                );
                DispatchResult::Succeeded {
                    tokens_consumed: completion.tokens,
                    latency_ms,
                }
            }
            Err(e) => {
                tracing::warn!(
                    task = %request.task,
                    provider = %request.provider,
                    error = %e,
                    "Dispatch failed"
                );
                DispatchResult::Failed {
                    kind: e.kind(),
                    detail: e.to_string(),
                }
            }
        }
    }
}

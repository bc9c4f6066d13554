//! LLM Client Trait
//!
//! Unified interface over provider APIs. Implementations report token
//! usage so the registry can enforce daily quotas, and classify their
//! failures so the scheduler can pick the right retry policy.

use async_trait::async_trait;
use thiserror::Error;

use taskmesh_types::ErrorKind;

/// A completed provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// Total tokens consumed (prompt + completion) as reported by the API.
    pub tokens: u64,
}

/// Errors surfaced by provider clients.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP {status} from provider: {body}")]
    Api { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Empty response from provider")]
    EmptyResponse,

    #[error("Missing API key: {0} not set")]
    MissingApiKey(&'static str),
}

impl ClientError {
    /// Map a client failure into the engine's error taxonomy.
    ///
    /// 4xx responses are permanent for this provider (bad request, auth);
    /// 429 and 5xx are transient, as are transport-level failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Api { status: 429, .. } => ErrorKind::TransientProvider,
            Self::Api { status, .. } if (400..500).contains(status) => {
                ErrorKind::PermanentProvider
            }
            Self::Api { .. } => ErrorKind::TransientProvider,
            Self::Transport(_) => ErrorKind::TransientProvider,
            Self::EmptyResponse => ErrorKind::TransientProvider,
            Self::MissingApiKey(_) => ErrorKind::PermanentProvider,
        }
    }
}

/// Unified LLM client interface.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Call the provider with system + user prompts, returning text plus
    /// token usage.
    async fn complete(&self, system_prompt: &str, user_prompt: &str)
        -> Result<Completion, ClientError>;

    /// Model name for logging.
    fn model_name(&self) -> &str;

    /// Provider family name for logging.
    fn provider_name(&self) -> &'static str;
}

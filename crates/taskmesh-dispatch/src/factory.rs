//! Client Factory
//!
//! Builds the right LLM client for a provider entry. API keys come from
//! the environment per provider kind; endpoint and model come from the
//! provider configuration.

use std::sync::Arc;

use taskmesh_types::{ProviderConfig, ProviderKind};

use crate::anthropic::AnthropicClient;
use crate::llm_client::{ClientError, LlmClient};
use crate::openai::OpenAiClient;

/// Create an LLM client for one configured provider.
pub fn build_client(cfg: &ProviderConfig) -> Result<Arc<dyn LlmClient>, ClientError> {
    match cfg.kind {
        ProviderKind::Anthropic => {
            let client = AnthropicClient::from_env(&cfg.endpoint, cfg.model.clone())?;
            Ok(Arc::new(client))
        }
        ProviderKind::OpenAi => {
            let client = OpenAiClient::from_env(&cfg.endpoint, cfg.model.clone())?;
            Ok(Arc::new(client))
        }
    }
}

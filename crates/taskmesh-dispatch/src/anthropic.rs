//! Anthropic Client
//!
//! LLM client implementation for the Anthropic Messages API.

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm_client::{ClientError, Completion, LlmClient};

/// Default Anthropic model
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Anthropic Messages API client
#[derive(Clone)]
pub struct AnthropicClient {
    api_key: String,
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl AnthropicClient {
    /// Create a client against the given endpoint base URL.
    pub fn new(api_key: String, endpoint: impl Into<String>, model: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    /// Create from the ANTHROPIC_API_KEY environment variable.
    pub fn from_env(endpoint: impl Into<String>, model: Option<String>) -> Result<Self, ClientError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ClientError::MissingApiKey("ANTHROPIC_API_KEY"))?;
        Ok(Self::new(api_key, endpoint, model))
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, ClientError> {
        let url = format!("{}/v1/messages", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&serde_json::json!({
                "model": &self.model,
                "max_tokens": 4096,
                "system": system_prompt,
                "messages": [{"role": "user", "content": user_prompt}]
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api { status, body });
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            text: Option<String>,
        }
        #[derive(Deserialize, Default)]
        struct Usage {
            #[serde(default)]
            input_tokens: u64,
            #[serde(default)]
            output_tokens: u64,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            content: Vec<ContentBlock>,
            #[serde(default)]
            usage: Option<Usage>,
        }

        let api_response: ApiResponse = response.json().await?;
        let text = api_response
            .content
            .first()
            .and_then(|c| c.text.clone())
            .ok_or(ClientError::EmptyResponse)?;
        let tokens = api_response
            .usage
            .map(|u| u.input_tokens + u.output_tokens)
            .unwrap_or(0);

        Ok(Completion { text, tokens })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &'static str {
        "Anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model() {
        let client = AnthropicClient::new("test-key".into(), "https://api.anthropic.com", None);
        assert_eq!(client.model_name(), DEFAULT_MODEL);
        assert_eq!(client.provider_name(), "Anthropic");
    }

    #[test]
    fn test_explicit_model() {
        let client = AnthropicClient::new(
            "test-key".into(),
            "https://api.anthropic.com",
            Some("claude-3-haiku".into()),
        );
        assert_eq!(client.model_name(), "claude-3-haiku");
    }
}

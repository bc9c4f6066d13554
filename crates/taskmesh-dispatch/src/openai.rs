//! OpenAI Client
//!
//! LLM client implementation for OpenAI-compatible chat-completions
//! endpoints.

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm_client::{ClientError, Completion, LlmClient};

/// Default OpenAI model
const DEFAULT_MODEL: &str = "gpt-4o";

/// OpenAI chat-completions client
#[derive(Clone)]
pub struct OpenAiClient {
    api_key: String,
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OpenAiClient {
    /// Create a client against the given endpoint base URL.
    pub fn new(api_key: String, endpoint: impl Into<String>, model: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    /// Create from the OPENAI_API_KEY environment variable.
    pub fn from_env(endpoint: impl Into<String>, model: Option<String>) -> Result<Self, ClientError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ClientError::MissingApiKey("OPENAI_API_KEY"))?;
        Ok(Self::new(api_key, endpoint, model))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, ClientError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.endpoint.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "model": &self.model,
                "messages": [
                    {"role": "system", "content": system_prompt},
                    {"role": "user", "content": user_prompt}
                ],
                "temperature": 0.1
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api { status, body });
        }

        #[derive(Deserialize)]
        struct Message {
            content: String,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize, Default)]
        struct Usage {
            #[serde(default)]
            total_tokens: u64,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            choices: Vec<Choice>,
            #[serde(default)]
            usage: Option<Usage>,
        }

        let api_response: ApiResponse = response.json().await?;
        let text = api_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or(ClientError::EmptyResponse)?;
        let tokens = api_response.usage.map(|u| u.total_tokens).unwrap_or(0);

        Ok(Completion { text, tokens })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &'static str {
        "OpenAI"
    }
}

//! Response generation.

use crate::config::{GenerationConfig, GenerationProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation backend is not configured: {0}")]
    Config(String),

    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation backend returned no text")]
    Empty,
}

/// Produces the agent's reply to one user utterance.
#[async_trait]
pub trait ResponseGenerator: Send + Sync + fmt::Debug {
    async fn generate(&self, system_prompt: &str, user_text: &str)
        -> Result<String, GenerationError>;
}

/// Canned reply that echoes the session prompt and the user's words.
#[derive(Debug, Default, Clone)]
pub struct TemplateResponder;

#[async_trait]
impl ResponseGenerator for TemplateResponder {
    async fn generate(
        &self,
        system_prompt: &str,
        user_text: &str,
    ) -> Result<String, GenerationError> {
        Ok(format!(
            "[Assistant ({})]: I heard you say '{}'. Here's a helpful response.",
            system_prompt, user_text
        ))
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsResponder {
    client: reqwest::Client,
    config: GenerationConfig,
}

impl fmt::Debug for ChatCompletionsResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatCompletionsResponder")
            .field("config", &self.config)
            .finish()
    }
}

impl ChatCompletionsResponder {
    pub fn new(config: GenerationConfig) -> Result<Self, GenerationError> {
        if config.api_key.trim().is_empty() {
            return Err(GenerationError::Config("API key is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GenerationError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionsResponder {
    async fn generate(
        &self,
        system_prompt: &str,
        user_text: &str,
    ) -> Result<String, GenerationError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_text,
                },
            ],
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Request(format!("{}: {}", status, text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Request(format!("invalid response body: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(GenerationError::Empty)
    }
}

/// Builds the configured generator. An unusable OpenAI configuration falls
/// back to the template reply so the service still answers.
pub fn build_generator(config: &GenerationConfig) -> Arc<dyn ResponseGenerator> {
    match config.provider {
        GenerationProvider::Template => Arc::new(TemplateResponder),
        GenerationProvider::Openai => match ChatCompletionsResponder::new(config.clone()) {
            Ok(responder) => Arc::new(responder),
            Err(e) => {
                tracing::warn!("falling back to template responses: {}", e);
                Arc::new(TemplateResponder)
            }
        },
    }
}

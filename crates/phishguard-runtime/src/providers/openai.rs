//! OpenAI chat completions provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use super::{
    endpoint::{check_base_url, Endpoint},
    factory::ProviderFactory,
    secrets::KeyRequirement,
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError, TokenUsage,
};

/// Environment variable name for the OpenAI API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

const OPENAI_KEY: KeyRequirement = KeyRequirement::new("OpenAI API key", OPENAI_API_KEY_ENV, 1);

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// OpenAI provider; also works against compatible gateways via `base_url`.
#[derive(Debug)]
pub struct OpenAiProvider {
    endpoint: Endpoint,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let credential = OPENAI_KEY.provided(api_key)?;
        Ok(Self {
            endpoint: Endpoint::build(credential, DEFAULT_BASE_URL, DEFAULT_MODEL)?,
        })
    }

    /// Provider from JSON configuration (`api_key`, `base_url`, `model`),
    /// falling back to `OPENAI_API_KEY` for the key.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        Ok(Self {
            endpoint: Endpoint::from_config(config, &OPENAI_KEY, DEFAULT_BASE_URL, DEFAULT_MODEL)?,
        })
    }

    pub fn model(&self) -> &str {
        &self.endpoint.model
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = self.endpoint.model_for(config.model.as_deref());
        let request = ChatRequest {
            model,
            messages: &messages,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
        };
        tracing::debug!(provider = "openai", model, "Sending chat completion request");

        let builder = self
            .endpoint
            .client
            .post(format!("{}/chat/completions", self.endpoint.base_url))
            .bearer_auth(self.endpoint.credential.expose());
        let body: ChatResponse = self.endpoint.send_json(builder, &request, config.timeout).await?;

        let (content, stop_reason) = match body.choices.into_iter().next() {
            Some(choice) => (choice.message.content.unwrap_or_default(), choice.finish_reason),
            None => (String::new(), None),
        };
        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            usage,
            model: body.model.unwrap_or_else(|| model.to_string()),
            stop_reason,
        })
    }

    async fn health_check(&self) -> bool {
        !self.endpoint.credential.expose().is_empty()
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Builds [`OpenAiProvider`]s from `provider_config`
/// (`api_key`, `base_url`, `model`; the key falls back to `OPENAI_API_KEY`).
pub struct OpenAiProviderFactory;

impl ProviderFactory for OpenAiProviderFactory {
    fn provider_type(&self) -> &'static str {
        "openai"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(OpenAiProvider::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        check_base_url(config)?;
        OPENAI_KEY.resolve(config).map(drop)
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({ "model": DEFAULT_MODEL })
    }
}

//! Google Gemini provider.
//!
//! Talks to the `generateContent` REST endpoint. System messages become the
//! request's `systemInstruction`; the remaining messages become `contents`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use super::{
    endpoint::{check_base_url, Endpoint},
    factory::ProviderFactory,
    secrets::KeyRequirement,
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, MessageRole, ProviderError,
    TokenUsage,
};

/// Environment variable name for the Gemini API key.
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Gemini keys are at least this long; shorter values are rejected.
pub const GEMINI_MIN_KEY_LEN: usize = 30;

const GEMINI_KEY: KeyRequirement =
    KeyRequirement::new("Gemini API key", GEMINI_API_KEY_ENV, GEMINI_MIN_KEY_LEN);

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-1.5-pro";

/// Gemini provider.
#[derive(Debug)]
pub struct GeminiProvider {
    endpoint: Endpoint,
}

impl GeminiProvider {
    /// Provider with an explicit API key, the public endpoint and the
    /// default model.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let credential = GEMINI_KEY.provided(api_key)?;
        Ok(Self {
            endpoint: Endpoint::build(credential, DEFAULT_BASE_URL, DEFAULT_MODEL)?,
        })
    }

    /// Provider from JSON configuration (`api_key`, `base_url`, `model`),
    /// falling back to `GEMINI_API_KEY` for the key.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        Ok(Self {
            endpoint: Endpoint::from_config(config, &GEMINI_KEY, DEFAULT_BASE_URL, DEFAULT_MODEL)?,
        })
    }

    /// Default model.
    pub fn model(&self) -> &str {
        &self.endpoint.model
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

fn text_content(role: Option<&str>, text: String) -> Content {
    Content {
        role: role.map(str::to_string),
        parts: vec![Part { text: Some(text) }],
    }
}

fn build_request(messages: Vec<ChatMessage>, config: &CompletionConfig) -> GenerateRequest {
    let mut system = Vec::new();
    let mut contents = Vec::new();
    for msg in messages {
        if msg.is_system() {
            system.push(msg.content);
        } else {
            // Gemini names the assistant role "model"
            let role = if msg.role == MessageRole::Assistant { "model" } else { "user" };
            contents.push(text_content(Some(role), msg.content));
        }
    }

    GenerateRequest {
        system_instruction: (!system.is_empty()).then(|| text_content(None, system.join("\n\n"))),
        contents,
        generation_config: GenerationConfig {
            temperature: config.temperature,
            max_output_tokens: config.max_tokens,
            top_k: config.top_k,
            top_p: config.top_p,
        },
    }
}


/// Concatenated text of the first candidate.
fn first_candidate_text(candidates: Vec<Candidate>) -> (String, Option<String>) {
    let Some(candidate) = candidates.into_iter().next() else {
        return (String::new(), None);
    };
    let text = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<String>())
        .unwrap_or_default();
    (text, candidate.finish_reason)
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = self.endpoint.model_for(config.model.as_deref());
        let request = build_request(messages, config);
        tracing::debug!(provider = "gemini", model, "Sending generateContent request");

        let builder = self
            .endpoint
            .client
            .post(format!("{}/models/{}:generateContent", self.endpoint.base_url, model))
            .header("x-goog-api-key", self.endpoint.credential.expose());
        let body: GenerateResponse = self.endpoint.send_json(builder, &request, config.timeout).await?;

        let (content, stop_reason) = first_candidate_text(body.candidates);
        let usage = body
            .usage_metadata
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            usage,
            model: body.model_version.unwrap_or_else(|| model.to_string()),
            stop_reason,
        })
    }

    async fn health_check(&self) -> bool {
        !self.endpoint.credential.expose().is_empty()
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

/// Builds [`GeminiProvider`]s from `provider_config`:
///
/// ```json
/// { "api_key": "AIza...", "base_url": "https://...", "model": "gemini-1.5-pro" }
/// ```
///
/// Every field is optional; the key falls back to `GEMINI_API_KEY`.
pub struct GeminiProviderFactory;

impl ProviderFactory for GeminiProviderFactory {
    fn provider_type(&self) -> &'static str {
        "gemini"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(GeminiProvider::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        check_base_url(config)?;
        GEMINI_KEY.resolve(config).map(drop)
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({ "model": DEFAULT_MODEL })
    }
}

//! LLM provider abstractions.
//!
//! Explanations are produced by exactly one [`LlmProvider`], chosen at
//! construction time through the [`ProviderRegistry`]. Gemini and OpenAI
//! implementations live behind the `gemini` and `openai` features.
//!
//! ## Credentials
//!
//! HTTP providers declare a [`KeyRequirement`] and hold the resolved key as
//! an [`ApiCredential`], which never prints its value.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[cfg(any(feature = "gemini", feature = "openai"))]
mod endpoint;
mod factory;
pub mod secrets;

#[cfg(feature = "gemini")]
mod gemini;

#[cfg(feature = "openai")]
mod openai;

pub use factory::{ProviderFactory, ProviderRegistry};
pub use secrets::{ApiCredential, CredentialSource, KeyRequirement};

#[cfg(feature = "gemini")]
pub use gemini::{GeminiProvider, GeminiProviderFactory, GEMINI_API_KEY_ENV};

#[cfg(feature = "openai")]
pub use openai::{OpenAiProvider, OpenAiProviderFactory, OPENAI_API_KEY_ENV};

/// Failures of a completion request.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("request to provider failed: {0}")]
    Transport(String),

    #[error("provider rate limit hit (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unreadable provider response: {0}")]
    Decode(String),

    #[error("provider rejected the API key")]
    Unauthorized,

    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),

    #[error("provider returned an empty completion")]
    EmptyResponse,

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

/// Generation options sent with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Model override; the provider's configured model when unset
    pub model: Option<String>,

    pub max_tokens: u32,

    pub temperature: f32,

    pub top_p: Option<f32>,

    /// Top-k sampling cutoff (Gemini only)
    pub top_k: Option<u32>,

    /// Per-request deadline, e.g. "30s"
    #[serde(with = "duration_human")]
    pub timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 800,
            temperature: 0.3,
            top_p: Some(0.95),
            top_k: Some(40),
            timeout: Duration::from_secs(30),
        }
    }
}

mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Speaker of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One turn of a chat prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }
}

/// A finished completion.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,

    /// Model that answered, as reported by the provider
    pub model: String,

    /// Provider-specific finish reason, e.g. "STOP" or "length"
    pub stop_reason: Option<String>,
}

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Source of generated explanations.
///
/// The explanation service is the only caller; the cache never talks to a
/// provider directly.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run one chat completion.
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Whether the provider is usable without sending a request.
    async fn health_check(&self) -> bool;

    /// Short name for logs, e.g. "gemini".
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roles_serialize_lowercase() {
        let system = ChatMessage::system("You are a security analyst.");
        assert!(system.is_system());
        assert!(!ChatMessage::user("Explain this URL.").is_system());

        let json = serde_json::to_value(ChatMessage::assistant("It imitates a bank login.")).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(serde_json::to_value(&system).unwrap()["role"], "system");
    }

    #[test]
    fn test_usage_total_saturates() {
        let usage = TokenUsage {
            prompt_tokens: u32::MAX,
            completion_tokens: 5,
        };
        assert_eq!(usage.total(), u32::MAX);
    }

    #[test]
    fn test_completion_config_yaml() {
        let config: CompletionConfig = serde_yaml::from_str(
            r#"
model: gemini-1.5-flash
temperature: 0.2
timeout: 45s
"#,
        )
        .unwrap();
        assert_eq!(config.model.as_deref(), Some("gemini-1.5-flash"));
        assert_eq!(config.timeout, Duration::from_secs(45));
        assert_eq!(config.max_tokens, 800);
        assert_eq!(config.top_k, Some(40));
    }
}

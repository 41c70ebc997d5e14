//! # phishguard-runtime
//!
//! LLM-backed explanations for PhishGuard analysis results.
//!
//! This crate turns a URL or email-header analysis into a short
//! natural-language explanation. Requests pass through a fixed-window rate
//! limiter and, unless disabled, the explanation cache from
//! `phishguard-cache`, so repeated or concurrent requests for the same
//! subject reach the provider at most once per record lifetime.
//!
//! ## Providers
//!
//! Providers are selected at construction time through a
//! [`ProviderRegistry`]. Network-backed providers sit behind cargo features:
//!
//! - `gemini`: Google Gemini (`GEMINI_API_KEY`)
//! - `openai`: OpenAI chat completions (`OPENAI_API_KEY`)
//!
//! ## Example
//!
//! ```rust,ignore
//! use phishguard_runtime::{ExplainerConfig, ExplanationService, ProviderRegistry};
//!
//! let config = ExplainerConfig::from_file("phishguard.yaml")?.with_env_overrides()?;
//! let service = ExplanationService::from_config(&config, &ProviderRegistry::with_defaults()).await?;
//!
//! let text = service
//!     .explain_url("https://bank-example.com/login", &serde_json::json!({ "risk_score": 91 }))
//!     .await?;
//! ```

pub mod config;
pub mod explainer;
pub mod prompts;
pub mod providers;
pub mod resilience;

pub use config::{ExplainerConfig, MODEL_ENV, PROVIDER_ENV, RPM_ENV};
pub use explainer::{ExplainError, ExplanationService};
pub use prompts::{truncate_prompt, MAX_PROMPT_CHARS};
pub use providers::{
    ApiCredential, ChatMessage, CompletionConfig, CompletionResponse, CredentialSource,
    KeyRequirement, LlmProvider, MessageRole, ProviderError, ProviderFactory, ProviderRegistry,
    TokenUsage,
};
pub use resilience::{RequestRateLimiter, DEFAULT_REQUESTS_PER_MINUTE};

#[cfg(feature = "gemini")]
pub use providers::{GeminiProvider, GeminiProviderFactory};

#[cfg(feature = "openai")]
pub use providers::{OpenAiProvider, OpenAiProviderFactory};

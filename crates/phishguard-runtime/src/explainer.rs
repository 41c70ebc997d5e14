//! Explanation service: prompts, rate limiting, provider and cache.

use phishguard_cache::{CacheError, ConfigError, ExplanationCache, SubjectKind};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ExplainerConfig;
use crate::prompts;
use crate::providers::{ChatMessage, CompletionConfig, LlmProvider, ProviderError, ProviderRegistry};
use crate::resilience::RequestRateLimiter;

/// Errors from [`ExplanationService`].
#[derive(Error, Debug)]
pub enum ExplainError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ExplainError {
    /// The provider failure behind this error, whether it came straight from
    /// the provider or through the cache.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            ExplainError::Provider(e) => Some(e),
            ExplainError::Cache(e) => e
                .compute_source()
                .and_then(|source| source.downcast_ref::<ProviderError>()),
            ExplainError::Config(_) => None,
        }
    }
}

enum Subject<'a> {
    Url(&'a str),
    Headers(&'a [u8]),
}

/// Produces natural-language explanations for URL and email analyses.
///
/// With a cache, concurrent requests for the same subject share one provider
/// call and repeated requests are served from the cache until the record
/// expires. Without one, every request calls the provider.
pub struct ExplanationService {
    provider: Arc<dyn LlmProvider>,
    cache: Option<ExplanationCache>,
    limiter: Arc<RequestRateLimiter>,
    completion: CompletionConfig,
    max_prompt_chars: usize,
}

impl ExplanationService {
    /// Assemble a service from parts.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        cache: Option<ExplanationCache>,
        config: &ExplainerConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            limiter: Arc::new(RequestRateLimiter::per_minute(config.requests_per_minute)),
            completion: config.completion.clone(),
            max_prompt_chars: config.max_prompt_chars,
        }
    }

    /// Build the provider from `registry` and open the cache when enabled.
    ///
    /// Starts the cache maintenance task when `cache.maintenance_interval`
    /// is set.
    pub async fn from_config(
        config: &ExplainerConfig,
        registry: &ProviderRegistry,
    ) -> Result<Self, ExplainError> {
        config.validate()?;
        let provider = registry.create(&config.provider, &config.provider_config)?;

        let cache = if config.cache.enabled {
            let cache = ExplanationCache::open(config.cache.clone()).await?;
            if let Some(interval) = config.cache.maintenance_interval {
                cache.spawn_maintenance(interval);
            }
            Some(cache)
        } else {
            tracing::info!("Explanation cache disabled, every request calls the provider");
            None
        };

        Ok(Self::new(provider, cache, config))
    }

    /// Explain the analysis result for `url`.
    pub async fn explain_url(&self, url: &str, analysis: &JsonValue) -> Result<String, ExplainError> {
        let messages = prompts::url_messages(url, analysis, self.max_prompt_chars);
        self.generate(Subject::Url(url), messages).await
    }

    /// Interpret the header analysis for the raw `headers` blob.
    ///
    /// The headers are cached by their exact bytes and need not be UTF-8.
    pub async fn explain_email(
        &self,
        headers: &[u8],
        analysis: &JsonValue,
    ) -> Result<String, ExplainError> {
        let text = String::from_utf8_lossy(headers);
        let messages = prompts::email_messages(&text, analysis, self.max_prompt_chars);
        self.generate(Subject::Headers(headers), messages).await
    }

    async fn generate(
        &self,
        subject: Subject<'_>,
        messages: Vec<ChatMessage>,
    ) -> Result<String, ExplainError> {
        let provider = Arc::clone(&self.provider);
        let limiter = Arc::clone(&self.limiter);
        let completion = self.completion.clone();

        let compute = move || async move {
            limiter.acquire().await;
            let response = provider.complete(messages, &completion).await?;
            tracing::debug!(
                provider = provider.name(),
                model = %response.model,
                tokens = response.usage.total(),
                "Explanation generated"
            );
            if response.content.trim().is_empty() {
                return Err(ProviderError::EmptyResponse);
            }
            Ok::<_, ProviderError>(response.content)
        };

        match (&self.cache, subject) {
            (Some(cache), Subject::Url(url)) => {
                Ok(cache.get_or_generate(url, SubjectKind::Url, compute).await?)
            }
            (Some(cache), Subject::Headers(headers)) => {
                Ok(cache.get_or_generate_blob(headers, compute).await?)
            }
            (None, _) => Ok(compute().await?),
        }
    }

    /// The cache, when enabled.
    pub fn cache(&self) -> Option<&ExplanationCache> {
        self.cache.as_ref()
    }

    /// Name of the configured provider.
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }
}

impl std::fmt::Debug for ExplanationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplanationService")
            .field("provider", &self.provider.name())
            .field("cache", &self.cache)
            .field("limiter", &self.limiter)
            .finish()
    }
}

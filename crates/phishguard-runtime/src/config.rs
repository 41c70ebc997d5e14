//! Explanation service configuration.
//!
//! ```yaml
//! provider: gemini
//! provider_config:
//!   model: gemini-1.5-pro
//! completion:
//!   temperature: 0.3
//!   timeout: 30s
//! requests_per_minute: 10
//! max_prompt_chars: 3000
//! cache:
//!   cache_dir: data/ai-cache
//!   max_age: 24h
//! ```

use phishguard_cache::{CacheConfig, ConfigError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::Path;

use crate::prompts::MAX_PROMPT_CHARS;
use crate::providers::CompletionConfig;
use crate::resilience::DEFAULT_REQUESTS_PER_MINUTE;

/// Overrides `requests_per_minute`.
pub const RPM_ENV: &str = "GEMINI_RPM";

/// Overrides the completion model.
pub const MODEL_ENV: &str = "GEMINI_MODEL";

/// Overrides the provider type.
pub const PROVIDER_ENV: &str = "PHISHGUARD_PROVIDER";

/// Everything needed to build an [`ExplanationService`](crate::ExplanationService).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainerConfig {
    /// Registered provider type, e.g. "gemini"
    pub provider: String,

    /// Provider-specific JSON configuration
    pub provider_config: JsonValue,

    /// Completion options sent with every request
    pub completion: CompletionConfig,

    /// Provider requests allowed per minute
    pub requests_per_minute: u32,

    /// Ceiling for the user prompt, in characters
    pub max_prompt_chars: usize,

    /// Explanation cache settings
    pub cache: CacheConfig,
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            provider_config: serde_json::json!({}),
            completion: CompletionConfig::default(),
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            max_prompt_chars: MAX_PROMPT_CHARS,
            cache: CacheConfig::default(),
        }
    }
}

impl ExplainerConfig {
    /// Parse from YAML (JSON is accepted as well).
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`, `.yml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            _ => serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides, including the cache's.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = lookup(PROVIDER_ENV) {
            self.provider = provider.trim().to_string();
        }
        if let Some(model) = lookup(MODEL_ENV) {
            self.completion.model = Some(model.trim().to_string());
        }
        if let Some(rpm) = lookup(RPM_ENV) {
            self.requests_per_minute = rpm.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "requests_per_minute",
                message: format!("{} must be a positive integer, got '{}'", RPM_ENV, rpm),
            })?;
        }
        self.cache = self.cache.with_overrides_from(&lookup)?;
        self.validate()?;
        Ok(self)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.is_empty() {
            return Err(ConfigError::Invalid {
                field: "provider",
                message: "must name a registered provider".to_string(),
            });
        }
        if self.requests_per_minute == 0 {
            return Err(ConfigError::Invalid {
                field: "requests_per_minute",
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_prompt_chars == 0 {
            return Err(ConfigError::Invalid {
                field: "max_prompt_chars",
                message: "must be at least 1".to_string(),
            });
        }
        if self.completion.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "completion.timeout",
                message: "must be positive".to_string(),
            });
        }
        self.cache.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = ExplainerConfig::default();
        assert_eq!(config.provider, "gemini");
        assert_eq!(config.requests_per_minute, 10);
        assert_eq!(config.max_prompt_chars, 3000);
        assert!(config.cache.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let config = ExplainerConfig::from_yaml_str(
            r#"
provider: openai
provider_config:
  model: gpt-4o-mini
completion:
  temperature: 0.7
  timeout: 20s
requests_per_minute: 30
cache:
  cache_dir: /var/lib/phishguard/cache
  max_age: 12h
"#,
        )
        .unwrap();

        assert_eq!(config.provider, "openai");
        assert_eq!(config.provider_config["model"], "gpt-4o-mini");
        assert_eq!(config.completion.timeout, Duration::from_secs(20));
        assert_eq!(config.requests_per_minute, 30);
        assert_eq!(config.cache.max_age, Duration::from_secs(12 * 3600));
        assert_eq!(config.max_prompt_chars, 3000);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (RPM_ENV, "25"),
            (MODEL_ENV, "gemini-1.5-flash"),
            ("PHISHGUARD_CACHE_ENABLED", "false"),
        ]
        .into_iter()
        .collect();

        let config = ExplainerConfig::default()
            .with_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.requests_per_minute, 25);
        assert_eq!(config.completion.model.as_deref(), Some("gemini-1.5-flash"));
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_invalid_rpm_rejected() {
        let result = ExplainerConfig::default()
            .with_overrides_from(|name| (name == RPM_ENV).then(|| "lots".to_string()));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "requests_per_minute", .. })
        ));

        let zero = ExplainerConfig {
            requests_per_minute: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}

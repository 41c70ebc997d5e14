//! API keys for LLM providers.
//!
//! Each provider declares a [`KeyRequirement`]: where its key may come from
//! and what a well-formed key looks like. Resolving a requirement yields an
//! [`ApiCredential`], whose value is held in a `secrecy::SecretString`,
//! printed as `[REDACTED]` and only reachable through
//! [`ApiCredential::expose`].
//!
//! ```ignore
//! const KEY: KeyRequirement = KeyRequirement::new("Gemini API key", "GEMINI_API_KEY", 30);
//!
//! let credential = KEY.resolve(&config)?;
//! request.header("x-goog-api-key", credential.expose());
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use std::fmt;

use super::ProviderError;

/// Configuration field holding an inline key.
pub const API_KEY_FIELD: &str = "api_key";

/// Substrings that mark a key copied from sample configuration.
const PLACEHOLDER_MARKERS: &[&str] = &["YOUR_API_KEY", "your-api-key", "<api-key>", "changeme"];

/// Where a credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Config,
    Environment,
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialSource::Config => "config",
            CredentialSource::Environment => "environment",
            CredentialSource::Programmatic => "caller",
        })
    }
}

/// A provider's API key.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
}

impl ApiCredential {
    /// The raw key, for the request that sends it.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    /// Where the key was found.
    pub fn source(&self) -> CredentialSource {
        self.source
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiCredential([REDACTED] from {})", self.source)
    }
}

/// How a provider finds and checks its API key.
#[derive(Debug, Clone, Copy)]
pub struct KeyRequirement {
    label: &'static str,
    env_var: &'static str,
    min_len: usize,
}

impl KeyRequirement {
    /// Key named `label` in messages, read from the `api_key` config field or
    /// `env_var`, at least `min_len` characters long.
    pub const fn new(label: &'static str, env_var: &'static str, min_len: usize) -> Self {
        Self {
            label,
            env_var,
            min_len,
        }
    }

    /// Environment variable consulted when the config has no key.
    pub fn env_var(&self) -> &'static str {
        self.env_var
    }

    /// Resolve from `config`, then the process environment.
    pub fn resolve(&self, config: &JsonValue) -> Result<ApiCredential, ProviderError> {
        self.resolve_with(config, |name| std::env::var(name).ok())
    }

    /// Resolve from `config`, then `lookup`.
    pub fn resolve_with<F>(&self, config: &JsonValue, lookup: F) -> Result<ApiCredential, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (value, source) = match config[API_KEY_FIELD].as_str() {
            Some(value) => (value.to_string(), CredentialSource::Config),
            None => match lookup(self.env_var) {
                Some(value) => (value, CredentialSource::Environment),
                None => {
                    return Err(ProviderError::NotConfigured(format!(
                        "{} required: set '{}' in provider_config or {}",
                        self.label, API_KEY_FIELD, self.env_var
                    )))
                }
            },
        };
        self.accept(value, source)
    }

    /// Wrap a key supplied directly by the caller.
    pub fn provided(&self, value: impl Into<String>) -> Result<ApiCredential, ProviderError> {
        self.accept(value.into(), CredentialSource::Programmatic)
    }

    /// Reject placeholder and too-short keys. Messages never quote the key.
    fn accept(&self, value: String, source: CredentialSource) -> Result<ApiCredential, ProviderError> {
        let value = value.trim().to_string();
        if PLACEHOLDER_MARKERS.iter().any(|marker| value.contains(marker)) {
            return Err(ProviderError::NotConfigured(format!(
                "{} from {} is a placeholder",
                self.label, source
            )));
        }
        if value.chars().count() < self.min_len.max(1) {
            return Err(ProviderError::NotConfigured(format!(
                "{} from {} is too short (expected at least {} characters)",
                self.label,
                source,
                self.min_len.max(1)
            )));
        }

        Ok(ApiCredential {
            value: SecretString::from(value),
            source,
        })
    }
}

//! Error types for the explanation cache.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by [`ExplanationCache`](crate::ExplanationCache) and the
/// entry stores.
///
/// The type is `Clone` because one outcome is delivered to every caller
/// attached to a coalesced computation. Non-clonable sources are held in an
/// `Arc`.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Corrupt cache record {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("Failed to serialize cache record: {0}")]
    Serialization(String),

    #[error("Explanation generation failed: {0}")]
    Compute(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),

    #[error("Timed out acquiring write lock for {key} after {attempts} attempts")]
    LockTimeout { key: String, attempts: usize },

    #[error("Generation task aborted: {0}")]
    TaskAborted(String),

    #[error("Cache configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Wrap an error returned by the generation collaborator.
    pub fn compute<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Compute(Arc::new(error))
    }

    /// The collaborator's original error, if this is a compute failure.
    ///
    /// Use `downcast_ref` on the result to recover the concrete type.
    pub fn compute_source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Compute(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }

    /// Whether the error came from the generation collaborator rather than
    /// from the cache itself.
    pub fn is_compute(&self) -> bool {
        matches!(self, Self::Compute(_))
    }
}

/// Errors from loading or validating a [`CacheConfig`](crate::CacheConfig).
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid duration '{value}': {message}")]
    InvalidDuration { value: String, message: String },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

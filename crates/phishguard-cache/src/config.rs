//! Cache configuration.
//!
//! Loaded from YAML or JSON. Durations use humantime notation (`"24h"`,
//! `"250ms"`). Missing fields take the defaults below.
//!
//! ```yaml
//! cache_dir: data/ai-cache
//! max_age: 24h
//! max_records: 50
//! records_to_keep: 50
//! max_size_bytes: 52428800
//! cleanup_threshold: 0.8
//! write_lock:
//!   policy: best_effort
//!   max_attempts: 5
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::lock::LockPolicy;

/// Overrides the cache directory.
pub const CACHE_DIR_ENV: &str = "PHISHGUARD_CACHE_DIR";

/// `false` or `0` disables caching entirely.
pub const CACHE_ENABLED_ENV: &str = "PHISHGUARD_CACHE_ENABLED";

/// Overrides `max_age` (humantime notation).
pub const CACHE_MAX_AGE_ENV: &str = "PHISHGUARD_CACHE_MAX_AGE";

/// Configuration for an [`ExplanationCache`](crate::ExplanationCache).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one JSON file per record
    pub cache_dir: PathBuf,

    /// When false, callers should bypass the cache
    pub enabled: bool,

    /// Records older than this are misses
    #[serde(with = "humantime_duration")]
    pub max_age: Duration,

    /// Record count that triggers count-based eviction
    pub max_records: usize,

    /// Most recent records that eviction always retains
    pub records_to_keep: usize,

    /// Size budget of the whole store
    pub max_size_bytes: u64,

    /// Fraction of `max_size_bytes` that triggers size-based eviction
    pub cleanup_threshold: f64,

    /// Fraction of `max_size_bytes` that size-based eviction shrinks to
    pub size_target_ratio: f64,

    /// Per-key write lock behavior
    pub write_lock: WriteLockConfig,

    /// Period of the background expiry/eviction sweep, if any
    #[serde(with = "humantime_duration::option")]
    pub maintenance_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/ai-cache"),
            enabled: true,
            max_age: Duration::from_secs(24 * 60 * 60),
            max_records: 50,
            records_to_keep: 50,
            max_size_bytes: 50 * 1024 * 1024,
            cleanup_threshold: 0.8,
            size_target_ratio: 0.7,
            write_lock: WriteLockConfig::default(),
            maintenance_interval: None,
        }
    }
}

/// Per-key write lock settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WriteLockConfig {
    /// What to do when the lock cannot be acquired
    pub policy: LockPolicy,

    /// Acquisition attempts before giving up
    pub max_attempts: usize,

    /// First backoff delay
    #[serde(with = "humantime_duration")]
    pub min_delay: Duration,

    /// Backoff delay ceiling
    #[serde(with = "humantime_duration")]
    pub max_delay: Duration,
}

impl Default for WriteLockConfig {
    fn default() -> Self {
        Self {
            policy: LockPolicy::BestEffort,
            max_attempts: 5,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }
}

impl CacheConfig {
    /// Config rooted at `cache_dir`, defaults elsewhere.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Default::default()
        }
    }

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

    /// Apply `PHISHGUARD_CACHE_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(CACHE_DIR_ENV) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(enabled) = lookup(CACHE_ENABLED_ENV) {
            self.enabled = !matches!(
                enabled.trim().to_ascii_lowercase().as_str(),
                "false" | "0" | "no" | "off"
            );
        }
        if let Some(max_age) = lookup(CACHE_MAX_AGE_ENV) {
            self.max_age = humantime::parse_duration(max_age.trim()).map_err(|e| {
                ConfigError::InvalidDuration {
                    value: max_age.clone(),
                    message: e.to_string(),
                }
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_records == 0 {
            return Err(ConfigError::invalid("max_records", "must be at least 1"));
        }
        if self.records_to_keep > self.max_records {
            return Err(ConfigError::invalid(
                "records_to_keep",
                format!(
                    "{} exceeds max_records ({})",
                    self.records_to_keep, self.max_records
                ),
            ));
        }
        if !(self.cleanup_threshold > 0.0 && self.cleanup_threshold <= 1.0) {
            return Err(ConfigError::invalid("cleanup_threshold", "must be in (0, 1]"));
        }
        if !(self.size_target_ratio > 0.0 && self.size_target_ratio <= self.cleanup_threshold) {
            return Err(ConfigError::invalid(
                "size_target_ratio",
                "must be in (0, cleanup_threshold]",
            ));
        }
        if self.max_age.is_zero() {
            return Err(ConfigError::invalid("max_age", "must be positive"));
        }
        if self.write_lock.max_attempts == 0 {
            return Err(ConfigError::invalid("write_lock.max_attempts", "must be at least 1"));
        }
        if self.write_lock.min_delay > self.write_lock.max_delay {
            return Err(ConfigError::invalid(
                "write_lock.min_delay",
                "must not exceed write_lock.max_delay",
            ));
        }
        Ok(())
    }

    /// Total size at which size-based eviction starts.
    pub fn size_trigger_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * self.cleanup_threshold).round() as u64
    }

    /// Total size size-based eviction shrinks below.
    pub fn size_target_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * self.size_target_ratio).round() as u64
    }
}

mod humantime_duration {
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
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

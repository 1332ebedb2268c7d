//! Client Configuration
//!
//! Serde-backed configuration with TOML file loading and environment
//! overrides. Core objects receive plain validated values; environment
//! lookups happen once in bootstrap code (`apply_env`), never inside the
//! queues or the transport.

use crate::transport::BackoffOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hard ceiling the remote API imposes on one batch payload (256 MiB)
pub const MAX_QUEUE_SIZE_CEILING: usize = 256 * 1024 * 1024;

/// Default batch size budget (5 MiB)
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 5 * 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

/// Error type for configuration loading and validation
#[derive(Debug)]
pub enum ConfigError {
    /// `max_queue_size` outside (0, 256 MiB]
    QueueSizeOutOfRange { given: usize },
    /// Config file could not be read
    Io(std::io::Error),
    /// Config file could not be parsed
    Parse(toml::de::Error),
    /// Environment override could not be parsed
    InvalidValue { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::QueueSizeOutOfRange { given } => write!(
                f,
                "Queue size {} is outside (0, {}]",
                given, MAX_QUEUE_SIZE_CEILING
            ),
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Config parse error: {}", e),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {}: {}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::QueueSizeOutOfRange { .. } | ConfigError::InvalidValue { .. } => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Remote API endpoints and credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the index API, without a trailing slash
    pub base_url: String,
    /// Bearer token sent on every control-plane call
    pub api_key: String,
    /// Source the feed targets
    pub source_id: String,
}

impl ApiConfig {
    /// True once every required field is set
    pub fn is_complete(&self) -> bool {
        !self.base_url.is_empty() && !self.api_key.is_empty() && !self.source_id.is_empty()
    }
}

/// Queue size budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum cumulative serialized record size buffered before an
    /// automatic flush, in bytes
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

impl QueueConfig {
    /// Budget for tests, small enough to trigger rotation quickly
    pub fn test() -> Self {
        QueueConfig {
            max_queue_size: 64 * 1024, // 64KB
        }
    }

    /// Exact budget in bytes
    pub fn with_max_queue_size(max_queue_size: usize) -> Self {
        QueueConfig { max_queue_size }
    }

    /// Check the budget is inside (0, 256 MiB]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 || self.max_queue_size > MAX_QUEUE_SIZE_CEILING {
            return Err(ConfigError::QueueSizeOutOfRange {
                given: self.max_queue_size,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Top-level configuration
// ============================================================================

/// Top-level configuration for the feed client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub backoff: BackoffOptions,
}

impl FeedConfig {
    /// Configuration for tests
    pub fn test() -> Self {
        FeedConfig {
            api: ApiConfig {
                base_url: "http://127.0.0.1:0".to_string(),
                api_key: "test-key".to_string(),
                source_id: "test-source".to_string(),
            },
            queue: QueueConfig::test(),
            backoff: BackoffOptions::test(),
        }
    }

    /// Load from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: FeedConfig = toml::from_str(&text)?;
        config.queue.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        FeedConfig::default().apply_env()
    }

    /// Apply environment overrides on top of this configuration
    ///
    /// Bootstrap-only. Recognized variables: `DOCFEED_BASE_URL`,
    /// `DOCFEED_API_KEY`, `DOCFEED_SOURCE_ID`, `DOCFEED_MAX_QUEUE_SIZE`.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an injected lookup
    ///
    /// `apply_env` passes the process environment; tests pass a map, so
    /// they never mutate shared process state.
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("DOCFEED_BASE_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = lookup("DOCFEED_API_KEY") {
            self.api.api_key = v;
        }
        if let Some(v) = lookup("DOCFEED_SOURCE_ID") {
            self.api.source_id = v;
        }
        if let Some(v) = lookup("DOCFEED_MAX_QUEUE_SIZE") {
            match v.parse::<usize>() {
                Ok(bytes) => self.queue.max_queue_size = bytes,
                Err(_) => {
                    return Err(ConfigError::InvalidValue {
                        key: "DOCFEED_MAX_QUEUE_SIZE",
                        value: v,
                    })
                }
            }
        }
        self.queue.validate()?;
        Ok(self)
    }
}

//! Runtime configuration types and defaults.
//!
//! This module defines the configuration options for the bridge runtime,
//! including worker pool size, stream read size and the log filter.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of worker threads for blocking operations
pub const DEFAULT_THREAD_POOL_SIZE: usize = 4;

/// Default size of a single stream read (64 KB)
pub const DEFAULT_STREAM_READ_SIZE: usize = 64 * 1024;

/// Default time to wait for worker threads at shutdown
pub const DEFAULT_POOL_SHUTDOWN_TIMEOUT_MS: u64 = 1000;

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Configuration for the bridge runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Worker threads used for filesystem, DNS and queued work
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,

    /// Maximum bytes delivered by a single stream read
    #[serde(default = "default_stream_read_size")]
    pub stream_read_size: usize,

    /// How long shutdown waits for busy worker threads
    #[serde(default = "default_pool_shutdown_timeout")]
    pub pool_shutdown_timeout_ms: u64,

    /// Fallback tracing filter
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            stream_read_size: DEFAULT_STREAM_READ_SIZE,
            pool_shutdown_timeout_ms: DEFAULT_POOL_SHUTDOWN_TIMEOUT_MS,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Set the worker pool size
    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size;
        self
    }

    /// Set the stream read size
    pub fn with_stream_read_size(mut self, bytes: usize) -> Self {
        self.stream_read_size = bytes;
        self
    }

    /// Set the worker shutdown timeout
    pub fn with_pool_shutdown_timeout(mut self, ms: u64) -> Self {
        self.pool_shutdown_timeout_ms = ms;
        self
    }

    /// Set the fallback log filter
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "thread_pool_size".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.thread_pool_size > 128 {
            return Err(ConfigError::InvalidValue {
                field: "thread_pool_size".into(),
                reason: "must be at most 128".into(),
            });
        }

        if self.stream_read_size < 64 {
            return Err(ConfigError::InvalidValue {
                field: "stream_read_size".into(),
                reason: "must be at least 64 bytes".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_thread_pool_size() -> usize {
    DEFAULT_THREAD_POOL_SIZE
}

fn default_stream_read_size() -> usize {
    DEFAULT_STREAM_READ_SIZE
}

fn default_pool_shutdown_timeout() -> u64 {
    DEFAULT_POOL_SHUTDOWN_TIMEOUT_MS
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.thread_pool_size, DEFAULT_THREAD_POOL_SIZE);
        assert_eq!(config.stream_read_size, DEFAULT_STREAM_READ_SIZE);
        assert_eq!(config.pool_shutdown_timeout_ms, DEFAULT_POOL_SHUTDOWN_TIMEOUT_MS);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_config_builder() {
        let config = RuntimeConfig::new()
            .with_thread_pool_size(2)
            .with_stream_read_size(4096)
            .with_pool_shutdown_timeout(50);

        assert_eq!(config.thread_pool_size, 2);
        assert_eq!(config.stream_read_size, 4096);
        assert_eq!(config.pool_shutdown_timeout_ms, 50);
    }

    #[test]
    fn test_config_validation() {
        assert!(RuntimeConfig::new().with_thread_pool_size(0).validate().is_err());
        assert!(RuntimeConfig::new().with_thread_pool_size(129).validate().is_err());
        assert!(RuntimeConfig::new().with_stream_read_size(8).validate().is_err());

        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            RuntimeConfig::from_json_str(r#"{"threadPoolSize": 8}"#).unwrap();
        assert_eq!(config.thread_pool_size, 8);
        assert_eq!(config.stream_read_size, DEFAULT_STREAM_READ_SIZE);
    }

    #[test]
    fn test_invalid_json_rejected() {
        let err = RuntimeConfig::from_json_str(r#"{"threadPoolSize": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"streamReadSize": 1024, "logFilter": "debug"}}"#).unwrap();

        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.stream_read_size, 1024);
        assert_eq!(config.log_filter, "debug");
    }
}

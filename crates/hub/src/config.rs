//! Configuration management for the StateBus hub.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/statebus/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("server_url must start with ws:// or wss://, got {0}")]
    InvalidServerUrl(String),

    #[error("app_name must be non-empty and free of topic syntax characters, got {0:?}")]
    InvalidAppName(String),

    #[error("retry window is invalid: min_interval_ms {min} exceeds max_delay_ms {max}")]
    InvalidRetryWindow {
        /// Configured minimum interval.
        min: u64,
        /// Configured maximum delay.
        max: u64,
    },

    #[error("heartbeat_interval_secs must be at least 1, got {0}")]
    InvalidHeartbeatInterval(u64),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Characters that would collide with topic-URI syntax in an app name.
const APP_NAME_FORBIDDEN: &[char] = &[':', '/', '#', '$', '{', '}'];

/// Main configuration structure for the StateBus hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Connection and app identity.
    pub connection: ConnectionConfig,

    /// Reconnect backoff tuning.
    pub retry: RetryConfig,

    /// One-shot request handling.
    pub requests: RequestConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

/// Connection and app identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// URL of the synchronization server.
    pub server_url: String,

    /// App namespace topics are resolved under.
    pub app_name: String,

    /// Interval between heartbeat pings, in seconds.
    pub heartbeat_interval_secs: u64,

    /// Grace period for the heartbeat pong, in seconds.
    pub heartbeat_timeout_secs: u64,
}

/// Reconnect backoff tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Floor added to every computed reconnect delay, in milliseconds.
    pub min_interval_ms: u64,

    /// Cap on the computed reconnect delay, in milliseconds.
    pub max_delay_ms: u64,
}

/// One-shot request handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Seconds before an unanswered request is abandoned (0 = wait forever).
    pub timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://bus.statebus.dev/v1".to_string(),
            app_name: "studio".to_string(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat grace period as a duration.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl RetryConfig {
    /// Backoff floor as a duration.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Backoff cap as a duration.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl RequestConfig {
    /// Request timeout as a duration; zero disables the timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("statebus")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - STATEBUS_SERVER_URL: Override the synchronization server URL
    /// - STATEBUS_APP_NAME: Override the app namespace
    /// - STATEBUS_LOG_LEVEL: Override the log level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("STATEBUS_SERVER_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding server_url from environment: {}", url);
                self.connection.server_url = url;
            }
        }

        if let Ok(app_name) = std::env::var("STATEBUS_APP_NAME") {
            if !app_name.is_empty() {
                tracing::info!("Overriding app_name from environment: {}", app_name);
                self.connection.app_name = app_name;
            }
        }

        if let Ok(level) = std::env::var("STATEBUS_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid
    /// range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.connection.server_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidServerUrl(url.clone()));
        }
        if Url::parse(url).is_err() {
            return Err(ConfigError::InvalidServerUrl(url.clone()));
        }

        let app_name = &self.connection.app_name;
        if app_name.is_empty() || app_name.contains(APP_NAME_FORBIDDEN) {
            return Err(ConfigError::InvalidAppName(app_name.clone()));
        }

        if self.retry.min_interval_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidRetryWindow {
                min: self.retry.min_interval_ms,
                max: self.retry.max_delay_ms,
            });
        }

        if self.connection.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval(
                self.connection.heartbeat_interval_secs,
            ));
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories if needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

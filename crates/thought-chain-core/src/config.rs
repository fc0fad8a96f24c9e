//! Client configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// How new attachment text is merged into a step's description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionMode {
    /// Overwrite with the latest text.
    #[default]
    Replace,
    /// Append with a separator, keeping all prior text.
    Keep,
}

impl DescriptionMode {
    /// Merge `incoming` into `current` according to this mode.
    pub fn merge(self, current: &mut String, incoming: &str, separator: &str) {
        match self {
            Self::Replace => {
                current.clear();
                current.push_str(incoming);
            }
            Self::Keep => {
                if !current.is_empty() {
                    current.push_str(separator);
                }
                current.push_str(incoming);
            }
        }
    }
}

/// Opaque header attached to every outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
}

/// Stream connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Time allowed for the transport to open, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Automatic reconnect attempts before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay in milliseconds; doubled per attempt.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_connect_timeout() -> u64 {
    5000
}

const fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Backoff before retry number `attempt` (zero-based): `base * 2^attempt`.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}

/// Root client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API root, e.g. `http://host:8000/api`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub auth_headers: Vec<HeaderConfig>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Session liveness probe interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub description_mode: DescriptionMode,
    #[serde(default = "default_separator")]
    pub description_separator: String,
    /// Roles whose step text is scanned for interpreter failures.
    #[serde(default = "default_code_roles")]
    pub code_roles: Vec<String>,
    /// Signals retained for late subscribers.
    #[serde(default = "default_signal_history")]
    pub signal_history: usize,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000/api".to_string()
}

fn default_heartbeat_interval() -> u64 {
    120_000
}

fn default_separator() -> String {
    "\n\n".to_string()
}

fn default_code_roles() -> Vec<String> {
    vec!["CodeInterpreter".to_string(), "code_interpreter".to_string()]
}

const fn default_signal_history() -> usize {
    256
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_headers: Vec::new(),
            connection: ConnectionConfig::default(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            description_mode: DescriptionMode::default(),
            description_separator: default_separator(),
            code_roles: default_code_roles(),
            signal_history: default_signal_history(),
        }
    }
}

impl ClientConfig {
    /// Parse a JSON config document.
    ///
    /// # Errors
    /// Returns error if the document is not valid config JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Builder-style description mode override.
    #[must_use]
    pub fn with_description_mode(mut self, mode: DescriptionMode) -> Self {
        self.description_mode = mode;
        self
    }
}

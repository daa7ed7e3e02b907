//! Gateway Configuration System
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub store: ChannelStoreConfig,
    pub failover: FailoverConfig,
    pub request_log: RequestLogConfig,
    pub debug_log: DebugLogConfig,
    pub user_agent: UserAgentConfig,

    /// Data directory for file-mode persistence.
    pub data_dir: String,

    /// Enable development mode (relaxed defaults, verbose logging).
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            store: ChannelStoreConfig::default(),
            failover: FailoverConfig::default(),
            request_log: RequestLogConfig::default(),
            debug_log: DebugLogConfig::default(),
            user_agent: UserAgentConfig::default(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_origins: vec!["http://localhost:4200".to_string()],
        }
    }
}

/// Channel/key store backend selection and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelStoreConfig {
    /// Backend: "file", "sqlite", or "postgres".
    pub backend: String,
    /// File-mode: path to the JSON document.
    pub file_path: String,
    /// DB-mode: connection string (sqlite or postgres URL).
    pub database_url: String,
    /// DB-mode polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Number of timestamped backups to retain in file mode.
    pub backup_count: usize,
}

impl Default for ChannelStoreConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            file_path: "./data/channels.json".to_string(),
            database_url: String::new(),
            poll_interval_ms: 1000,
            backup_count: 10,
        }
    }
}

/// Failover engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    pub generic_resource_wait_seconds: u64,
    pub model_cooldown_extra_seconds: u64,
    pub model_cooldown_max_wait_seconds: u64,
    /// Base cooldown window for a failed key, in seconds (default 300 = 5 min).
    pub key_cooldown_base_window_seconds: u64,
    /// Strikes before the cooldown window doubles.
    pub key_cooldown_max_failure_count: u32,
    /// Metrics sliding-window size for circuit trip evaluation.
    pub circuit_window_size: usize,
    pub circuit_failure_threshold: f64,
    pub circuit_recovery_seconds: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            generic_resource_wait_seconds: 20,
            model_cooldown_extra_seconds: 1,
            model_cooldown_max_wait_seconds: 60,
            key_cooldown_base_window_seconds: 300,
            key_cooldown_max_failure_count: 3,
            circuit_window_size: 10,
            circuit_failure_threshold: 0.5,
            circuit_recovery_seconds: 15 * 60,
        }
    }
}

/// Request log retention and SSE settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLogConfig {
    pub retention_days: u32,
    pub stale_pending_timeout_seconds: u64,
    pub default_page_limit: u32,
    pub max_page_limit: u32,
    pub sse_subscriber_capacity: usize,
    pub max_subscribers: usize,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            stale_pending_timeout_seconds: 300,
            default_page_limit: 100,
            max_page_limit: 1000,
            sse_subscriber_capacity: 100,
            max_subscribers: 100,
        }
    }
}

/// Debug log (request/response body capture) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugLogConfig {
    pub enabled: bool,
    pub retention_hours: u64,
    pub max_body_size: usize,
}

impl Default for DebugLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_hours: 24,
            max_body_size: 64 * 1024,
        }
    }
}

/// User-Agent capture/fallback defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAgentConfig {
    pub messages_default: String,
    pub responses_default: String,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            messages_default: "claude-cli/2.1.12 (external, cli)".to_string(),
            responses_default: "codex_cli_rs/0.73.0 (Linux; x86_64)".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Gateway Configuration
# Environment variables override these settings

[http]
port = 8080
host = "0.0.0.0"
cors_origins = ["http://localhost:4200"]

[store]
backend = "file"  # file, sqlite, or postgres
file_path = "./data/channels.json"
database_url = ""
poll_interval_ms = 1000
backup_count = 10

[failover]
enabled = true
generic_resource_wait_seconds = 20
model_cooldown_extra_seconds = 1
model_cooldown_max_wait_seconds = 60
key_cooldown_base_window_seconds = 300
key_cooldown_max_failure_count = 3
circuit_window_size = 10
circuit_failure_threshold = 0.5
circuit_recovery_seconds = 900

[request_log]
retention_days = 30
stale_pending_timeout_seconds = 300
default_page_limit = 100
max_page_limit = 1000
sse_subscriber_capacity = 100
max_subscribers = 100

[debug_log]
enabled = false
retention_hours = 24
max_body_size = 65536

[user_agent]
messages_default = "claude-cli/2.1.12 (external, cli)"
responses_default = "codex_cli_rs/0.73.0 (Linux; x86_64)"

data_dir = "./data"
dev_mode = false
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_toml_round_trips() {
        let parsed: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        assert_eq!(parsed.http.port, 8080);
        assert_eq!(parsed.store.backend, "file");
        assert!(parsed.failover.enabled);
    }

    #[test]
    fn defaults_match_spec_values() {
        let config = AppConfig::default();
        assert_eq!(config.failover.key_cooldown_base_window_seconds, 300);
        assert_eq!(config.failover.key_cooldown_max_failure_count, 3);
        assert_eq!(config.request_log.max_page_limit, 1000);
    }
}

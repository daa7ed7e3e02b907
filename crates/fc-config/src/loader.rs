//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "gateway.toml",
    "./config/config.toml",
    "/etc/fc-gateway/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("FC_GATEWAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("FC_GATEWAY_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("FC_GATEWAY_HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("FC_GATEWAY_CORS_ORIGINS") {
            config.http.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Ok(val) = env::var("FC_GATEWAY_STORE_BACKEND") {
            config.store.backend = val;
        }
        if let Ok(val) = env::var("FC_GATEWAY_STORE_FILE_PATH") {
            config.store.file_path = val;
        }
        if let Ok(val) = env::var("FC_GATEWAY_STORE_DATABASE_URL") {
            config.store.database_url = val;
        }
        if let Ok(val) = env::var("FC_GATEWAY_STORE_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                config.store.poll_interval_ms = ms;
            }
        }

        if let Ok(val) = env::var("FC_GATEWAY_FAILOVER_ENABLED") {
            config.failover.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("FC_GATEWAY_GENERIC_RESOURCE_WAIT_SECONDS") {
            if let Ok(v) = val.parse() {
                config.failover.generic_resource_wait_seconds = v;
            }
        }

        if let Ok(val) = env::var("FC_GATEWAY_REQUEST_LOG_RETENTION_DAYS") {
            if let Ok(v) = val.parse() {
                config.request_log.retention_days = v;
            }
        }
        if let Ok(val) = env::var("FC_GATEWAY_REQUEST_LOG_STALE_TIMEOUT_SECONDS") {
            if let Ok(v) = val.parse() {
                config.request_log.stale_pending_timeout_seconds = v;
            }
        }

        if let Ok(val) = env::var("FC_GATEWAY_DEBUG_LOG_ENABLED") {
            config.debug_log.enabled = val.parse().unwrap_or(false);
        }

        if let Ok(val) = env::var("FC_GATEWAY_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("FC_GATEWAY_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let loader = ConfigLoader::with_path("/nonexistent/path/config.toml");
        let config = loader.load().unwrap();
        assert_eq!(config.http.port, 8080);
    }
}

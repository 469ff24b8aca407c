//! Configuration loader with file discovery and environment overrides.

use std::env;
use std::path::PathBuf;

use tracing::info;

use crate::{AppConfig, ConfigError};

/// Standard config file search paths, in order.
const CONFIG_PATHS: &[&str] = &[
    "relay.toml",
    "config.toml",
    "./config/relay.toml",
    "/etc/relay/relay.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load from the first config file found (defaults if none), then
    /// apply environment overrides, then validate.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                let content = std::fs::read_to_string(&path)?;
                toml::from_str(&content)?
            }
            None => AppConfig::default(),
        };

        self.apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("RELAY_HTTP_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.mediator.http.timeout_ms = timeout;
            }
        }
        if let Ok(val) = env::var("RELAY_FAST_FAIL_VISIBILITY_SECONDS") {
            if let Ok(seconds) = val.parse() {
                config.mediator.http.fast_fail_visibility_seconds = seconds;
            }
        }
        if let Ok(val) = env::var("RELAY_DEFAULT_VISIBILITY_DELAY_SECONDS") {
            if let Ok(seconds) = val.parse() {
                config.mediator.http.default_visibility_delay_seconds = seconds;
            }
        }

        if let Ok(val) = env::var("RELAY_STANDBY_ENABLED") {
            config.standby.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("RELAY_REDIS_URL") {
            config.standby.redis_url = val;
        }
        if let Ok(val) = env::var("RELAY_STANDBY_LOCK_KEY") {
            config.standby.lock_key = val;
        }
        if let Ok(val) = env::var("RELAY_INSTANCE_ID") {
            config.standby.instance_id = val;
        }
        if let Ok(val) = env::var("RELAY_STANDBY_LOCK_TTL") {
            if let Ok(ttl) = val.parse() {
                config.standby.lock_ttl_seconds = ttl;
            }
        }

        if let Ok(val) = env::var("RELAY_VISIBILITY_EXTENSION_INTERVAL") {
            if let Ok(interval) = val.parse() {
                config.lifecycle.visibility_extension_interval_seconds = interval;
            }
        }

        if let Ok(val) = env::var("RELAY_SHUTDOWN_GRACE_SECONDS") {
            if let Ok(grace) = val.parse() {
                config.shutdown.grace_seconds = grace;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

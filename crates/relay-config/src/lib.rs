//! Relay Configuration
//!
//! TOML-based configuration with environment variable overrides. Sections
//! map one-to-one onto the core's settings types; everything defaults so a
//! bare file (or no file) yields a runnable dev configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use relay_core::{
    BreakerSettings, LifecycleSettings, MediatorSettings, PoolConfig, QueueSettings,
    StandbySettings,
};

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub pools: Vec<PoolConfig>,
    pub queues: Vec<QueueSettings>,
    pub circuit_breaker: BreakerSettings,
    pub mediator: MediatorConfig,
    pub lifecycle: LifecycleSettings,
    pub standby: StandbySettings,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MediatorConfig {
    pub http: MediatorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long to wait for pools to drain before releasing leftovers.
    pub grace_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_seconds: 60 }
    }
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load with file discovery and environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_pools = std::collections::HashSet::new();
        for pool in &self.pools {
            if pool.code.is_empty() {
                return Err(ConfigError::Validation("pool with empty code".to_string()));
            }
            if !seen_pools.insert(&pool.code) {
                return Err(ConfigError::Validation(format!(
                    "duplicate pool code [{}]",
                    pool.code
                )));
            }
            if pool.max_concurrency == 0 {
                return Err(ConfigError::Validation(format!(
                    "pool [{}] has zero concurrency",
                    pool.code
                )));
            }
            if let Some(rate) = &pool.rate_limit {
                if rate.per_second > 0 && rate.burst == Some(0) {
                    return Err(ConfigError::Validation(format!(
                        "pool [{}] has zero burst with a non-zero rate",
                        pool.code
                    )));
                }
            }
        }

        let mut seen_queues = std::collections::HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(ConfigError::Validation("queue with empty name".to_string()));
            }
            if !seen_queues.insert(&queue.name) {
                return Err(ConfigError::Validation(format!(
                    "duplicate queue name [{}]",
                    queue.name
                )));
            }
        }

        if self.circuit_breaker.window_size == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.window_size must be positive".to_string(),
            ));
        }
        if self.circuit_breaker.failure_rate_percent > 100 {
            return Err(ConfigError::Validation(
                "circuit_breaker.failure_rate_percent must be 0..=100".to_string(),
            ));
        }

        Ok(())
    }

    /// Example TOML configuration.
    pub fn example_toml() -> String {
        r#"# Relay configuration
# Environment variables (RELAY_*) override these settings.

[[pools]]
code = "DEFAULT"
max_concurrency = 20

[[pools]]
code = "WEBHOOKS"
max_concurrency = 10

[pools.rate_limit]
per_second = 50
burst = 100

[[queues]]
name = "jobs"
kind = "memory"            # memory, sqlite, or sqs
uri = ""                   # sqlite file path or SQS queue URL
connections = 1
metrics_poll_interval_seconds = 30
receive_timeout_ms = 5000

[circuit_breaker]
window_size = 100
failure_rate_percent = 50
minimum_calls = 10
open_duration_seconds = 30
half_open_permitted_calls = 5
idle_ttl_seconds = 3600

[mediator.http]
timeout_ms = 900000
default_visibility_delay_seconds = 120
fast_fail_visibility_seconds = 10

[lifecycle]
visibility_extension_interval_seconds = 55

[standby]
enabled = false
redis_url = "redis://127.0.0.1:6379"
lock_key = "relay:leader"
instance_id = ""           # defaults to a random UUID
lock_ttl_seconds = 30

[shutdown]
grace_seconds = 60
"#
        .to_string()
    }
}

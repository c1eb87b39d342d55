//! Scheduler service configuration
//!
//! Configuration loaded from environment variables and command line.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::controller::ControllerConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Scheduler service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Minimum time between two operators on the same shard
    pub throttle_cooldown_secs: u64,

    /// Interval between operator patrols in milliseconds
    pub patrol_interval_ms: u64,

    /// Operators running longer than this are abandoned
    pub operator_timeout_secs: u64,

    /// Default per-node budget in limited steps per minute
    pub node_limit_rate: f64,

    /// How long finished operators stay queryable
    pub history_retention_secs: u64,

    /// Dry run mode (track operators, never send steps)
    pub dry_run: bool,

    /// Scheduler types started when nothing has been persisted yet
    pub initial_schedulers: Vec<String>,

    /// Where the active scheduler list is persisted; in memory when unset
    pub config_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            throttle_cooldown_secs: 300, // 5 minutes
            patrol_interval_ms: 100,
            operator_timeout_secs: 600,
            node_limit_rate: 15.0,
            history_retention_secs: 30 * 60,
            dry_run: false,
            initial_schedulers: vec![
                "balance-leader".to_string(),
                "balance-region".to_string(),
                "hot-region".to_string(),
            ],
            config_path: None,
        }
    }
}

/// Parse `name` when set; unset falls back to `default`
fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

impl ServiceConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let throttle_cooldown_secs =
            env_parse("SHARDPLACE_THROTTLE_COOLDOWN", defaults.throttle_cooldown_secs)?;
        let patrol_interval_ms =
            env_parse("SHARDPLACE_PATROL_INTERVAL_MS", defaults.patrol_interval_ms)?;
        let operator_timeout_secs =
            env_parse("SHARDPLACE_OPERATOR_TIMEOUT", defaults.operator_timeout_secs)?;
        let node_limit_rate = env_parse("SHARDPLACE_NODE_LIMIT_RATE", defaults.node_limit_rate)?;
        let history_retention_secs =
            env_parse("SHARDPLACE_HISTORY_RETENTION", defaults.history_retention_secs)?;

        let dry_run = std::env::var("SHARDPLACE_DRY_RUN")
            .ok()
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.dry_run);

        let initial_schedulers = std::env::var("SHARDPLACE_SCHEDULERS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.initial_schedulers);

        let config_path = std::env::var("SHARDPLACE_CONFIG_PATH").ok().map(PathBuf::from);

        let config = Self {
            throttle_cooldown_secs,
            patrol_interval_ms,
            operator_timeout_secs,
            node_limit_rate,
            history_retention_secs,
            dry_run,
            initial_schedulers,
            config_path,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.patrol_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "patrol_interval_ms".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.node_limit_rate <= 0.0 || !self.node_limit_rate.is_finite() {
            return Err(ConfigError::InvalidValue(
                "node_limit_rate".to_string(),
                self.node_limit_rate.to_string(),
            ));
        }
        Ok(())
    }

    pub fn throttle_cooldown(&self) -> Duration {
        Duration::from_secs(self.throttle_cooldown_secs)
    }

    pub fn patrol_interval(&self) -> Duration {
        Duration::from_millis(self.patrol_interval_ms)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            operator_timeout: Duration::from_secs(self.operator_timeout_secs),
            history_retention: Duration::from_secs(self.history_retention_secs),
            node_limit_rate: self.node_limit_rate,
            dry_run: self.dry_run,
        }
    }
}

//! Engine Configuration
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `CIRCRUNNER_*` environment variables. The CLI applies its own flags last.
//!
//! ```yaml
//! database_path: /var/lib/circrunner/circrunner.db
//! output_dir: /data/user_outputs
//! worker_pool_size: 1
//! step_timeout_secs: 86400
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// At most one step runs at any instant, across all pipelines.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 1;

pub const DEFAULT_DATABASE: &str = "circrunner.db";
pub const DEFAULT_OUTPUT_DIR: &str = "user_outputs";

pub const ENV_DATABASE: &str = "CIRCRUNNER_DATABASE";
pub const ENV_OUTPUT_DIR: &str = "CIRCRUNNER_OUTPUT_DIR";
pub const ENV_WORKERS: &str = "CIRCRUNNER_WORKERS";
pub const ENV_STEP_TIMEOUT: &str = "CIRCRUNNER_STEP_TIMEOUT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Runtime settings for the engine and its worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file.
    pub database_path: PathBuf,

    /// Root of per-user, per-pipeline output directories.
    pub output_dir: PathBuf,

    /// Number of background workers draining the run queue.
    pub worker_pool_size: usize,

    /// Per-step deadline. `None` lets a step run indefinitely.
    pub step_timeout_secs: Option<u64>,

    /// How long to wait for a cancelled or overdue step to return.
    pub cancel_grace_secs: u64,

    /// Attempts for each durable write before it is treated as fatal.
    pub persist_retries: u32,

    /// Delay before the first retry; doubled on each further attempt.
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            step_timeout_secs: None,
            cancel_grace_secs: 30,
            persist_retries: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Loads a YAML file; missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Loaded engine config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Applies `CIRCRUNNER_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DATABASE) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup(ENV_OUTPUT_DIR) {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.worker_pool_size = parse_number(ENV_WORKERS, &workers)?;
        }
        if let Some(timeout) = lookup(ENV_STEP_TIMEOUT) {
            self.step_timeout_secs = match timeout.trim() {
                "" | "0" | "none" => None,
                value => Some(parse_number(ENV_STEP_TIMEOUT, value)?),
            };
        }
        self.validate()
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.step_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "step_timeout_secs must be positive (omit it for no deadline)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

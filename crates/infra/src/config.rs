//! Configuration loading and representation.
//!
//! Sources, later wins:
//! 1. built-in defaults
//! 2. optional TOML file (path in `TEXTGUARD_CONFIG`)
//! 3. `TEXTGUARD_*` environment variables

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

pub const CONFIG_PATH_VAR: &str = "TEXTGUARD_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Values consumed by the orchestrator, workers and sweeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// JSON model artifact; when absent the worker starts with an empty model slot
    pub model_path: Option<PathBuf>,
    /// Version tag used until a model is loaded
    pub model_version: String,
    /// Postgres URL; in-memory repository when absent
    pub database_url: Option<String>,
    /// Redis URL; in-memory queue when absent
    pub redis_url: Option<String>,
    pub scoring_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub visibility_timeout_secs: u64,
    pub retention_days: u32,
    pub sweep_interval_secs: u64,
    pub sweep_timeout_secs: u64,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            model_version: "1.0".to_string(),
            database_url: None,
            redis_url: None,
            scoring_timeout_ms: 5_000,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            visibility_timeout_secs: 30,
            retention_days: 30,
            sweep_interval_secs: 3_600,
            sweep_timeout_secs: 60,
            worker_count: 4,
            poll_interval_ms: 250,
        }
    }
}

impl PipelineConfig {
    /// Load from the process environment (and the file it points to, if any).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::load`] with an injectable variable lookup.
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TEXTGUARD_MODEL_PATH") {
            self.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TEXTGUARD_MODEL_VERSION") {
            self.model_version = v;
        }
        if let Some(v) = lookup("TEXTGUARD_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            self.database_url = Some(v);
        }
        if let Some(v) = lookup("TEXTGUARD_REDIS_URL") {
            self.redis_url = Some(v);
        }
        parse_into(lookup, "TEXTGUARD_SCORING_TIMEOUT_MS", &mut self.scoring_timeout_ms)?;
        parse_into(lookup, "TEXTGUARD_MAX_ATTEMPTS", &mut self.max_attempts)?;
        parse_into(lookup, "TEXTGUARD_BACKOFF_BASE_MS", &mut self.backoff_base_ms)?;
        parse_into(lookup, "TEXTGUARD_BACKOFF_MAX_MS", &mut self.backoff_max_ms)?;
        parse_into(lookup, "TEXTGUARD_VISIBILITY_TIMEOUT_SECS", &mut self.visibility_timeout_secs)?;
        parse_into(lookup, "TEXTGUARD_RETENTION_DAYS", &mut self.retention_days)?;
        parse_into(lookup, "TEXTGUARD_SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs)?;
        parse_into(lookup, "TEXTGUARD_SWEEP_TIMEOUT_SECS", &mut self.sweep_timeout_secs)?;
        parse_into(lookup, "TEXTGUARD_WORKER_COUNT", &mut self.worker_count)?;
        parse_into(lookup, "TEXTGUARD_POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.scoring_timeout_ms == 0 {
            return Err(ConfigError::Invalid("scoring_timeout_ms must be positive".into()));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "backoff_max_ms must not be below backoff_base_ms".into(),
            ));
        }
        if self.visibility_timeout_secs == 0 {
            return Err(ConfigError::Invalid("visibility_timeout_secs must be positive".into()));
        }
        if self.sweep_interval_secs == 0 || self.sweep_timeout_secs == 0 {
            return Err(ConfigError::Invalid("sweep interval and timeout must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        Ok(())
    }

    pub fn scoring_timeout(&self) -> Duration {
        Duration::from_millis(self.scoring_timeout_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_secs(self.sweep_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

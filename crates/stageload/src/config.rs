//! Pipeline configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::staging::KeyFormatter;
use crate::storage::StorageConfig;
use crate::warehouse::{
    RetryPolicy, WarehouseConfig, DEFAULT_MAX_ERRORS, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE,
};

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default number of parallel shards.
pub const DEFAULT_SHARDS: usize = 1;

/// Everything a [`LoadPipeline`](crate::pipeline::LoadPipeline) needs besides
/// its collaborators.
#[derive(Clone)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub warehouse: WarehouseConfig,
    /// Number of parallel shards, fixed for the pipeline's lifetime
    pub shards: usize,
    /// Retries after a serializable-isolation conflict
    pub max_retries: u32,
    /// Malformed rows `COPY` tolerates; `None` omits `MAXERROR`
    pub max_errors: Option<u64>,
    /// Backoff base; the n-th retry waits `retry_base * 2^n`
    pub retry_base: Duration,
    /// Directory for local shard files (system temp dir when unset)
    pub staging_dir: Option<PathBuf>,
    /// Overrides the default time-bucketed key root
    pub key_formatter: Option<KeyFormatter>,
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("storage", &self.storage)
            .field("warehouse", &self.warehouse)
            .field("shards", &self.shards)
            .field("max_retries", &self.max_retries)
            .field("max_errors", &self.max_errors)
            .field("retry_base", &self.retry_base)
            .field("staging_dir", &self.staging_dir)
            .field("key_formatter", &self.key_formatter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl PipelineConfig {
    pub fn new(storage: StorageConfig, warehouse: WarehouseConfig) -> Self {
        Self {
            storage,
            warehouse,
            shards: DEFAULT_SHARDS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_errors: Some(DEFAULT_MAX_ERRORS),
            retry_base: DEFAULT_RETRY_BASE,
            staging_dir: None,
            key_formatter: None,
        }
    }

    /// Load from the environment (and a `.env` file, when present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Self::new(StorageConfig::from_env()?, WarehouseConfig::from_env()?);

        if let Some(shards) = parse_env("STAGELOAD_SHARDS")? {
            config.shards = shards;
        }
        if let Some(retries) = parse_env("STAGELOAD_MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Ok(raw) = std::env::var("STAGELOAD_MAX_ERRORS") {
            config.max_errors = parse_max_errors(&raw)?;
        }
        if let Ok(dir) = std::env::var("STAGELOAD_STAGING_DIR") {
            config.staging_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.warehouse.validate()?;

        if self.shards == 0 {
            return Err(ConfigError::invalid("shards", "must be at least 1"));
        }
        if let Some(dir) = &self.staging_dir {
            if !dir.is_dir() {
                return Err(ConfigError::invalid(
                    "staging_dir",
                    format!("{} is not a directory", dir.display()),
                ));
            }
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base)
    }
}

/// `none`/`off` omit the clause; any integer (zero included) is used as is.
pub fn parse_max_errors(raw: &str) -> Result<Option<u64>, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "none" | "off" => Ok(None),
        value => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid("max_errors", format!("'{}' is not a number", raw))),
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(var, format!("'{}' is not a valid value", raw))),
        Err(_) => Ok(None),
    }
}

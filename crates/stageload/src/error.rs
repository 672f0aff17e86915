//! Error types for the staged-load pipeline

use std::sync::Arc;
use thiserror::Error;

use crate::warehouse::WarehouseError;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Required settings missing or unusable at construction time
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// The user transform rejected a record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transform rejected record: {message}")]
pub struct TransformError {
    pub message: String,
}

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Staging upload failures
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to upload {key}: {message}")]
    Put { key: String, message: String },

    #[error("Failed to read staged shard: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode manifest: {0}")]
    Manifest(#[from] stageload_common::CommonError),
}

/// Terminal warehouse load failures
#[derive(Error, Debug)]
pub enum LoadError {
    /// Non-retryable failure, surfaced on the attempt where it happened
    #[error("Warehouse load failed on attempt {attempts}: {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: WarehouseError,
    },

    /// The transaction kept colliding with concurrent writers
    #[error("Warehouse load still conflicting after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: WarehouseError,
    },
}

impl LoadError {
    /// Number of transaction attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            LoadError::Failed { attempts, .. } | LoadError::RetriesExhausted { attempts, .. } => {
                *attempts
            },
        }
    }

    /// The warehouse error of the final attempt, unchanged
    pub fn warehouse_error(&self) -> &WarehouseError {
        match self {
            LoadError::Failed { source, .. } | LoadError::RetriesExhausted { source, .. } => source,
        }
    }
}

/// Failures while cleaning up after a failed transaction.
///
/// These are only ever handed to the [`ErrorReporter`]; they never replace
/// the error that caused the cleanup.
#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("Rollback of load into staging table {staging_table} failed: {source}")]
    Rollback {
        staging_table: String,
        #[source]
        source: WarehouseError,
    },

    #[error("Failed to close warehouse session: {source}")]
    Close {
        #[source]
        source: WarehouseError,
    },
}

/// Callback receiving non-fatal errors
pub type ErrorReporter = Arc<dyn Fn(&RollbackError) + Send + Sync>;

/// Reporter that logs through `tracing`
pub fn log_reporter() -> ErrorReporter {
    Arc::new(|err: &RollbackError| {
        tracing::error!(error = %err, "Non-fatal warehouse cleanup error");
    })
}

/// Everything that can end a pipeline run in `Failed`
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] stageload_common::CommonError),

    #[error("Shard I/O failed: {0}")]
    Shard(#[source] std::io::Error),

    #[error("Staging upload failed: {0}")]
    Upload(#[from] StorageError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Pipeline aborted after an earlier write failed: {reason}")]
    Aborted { reason: String },
}

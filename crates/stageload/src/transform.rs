//! Per-record transforms applied before sharding

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use stageload_common::Record;

use crate::error::TransformError;

/// Timestamp format the warehouse parses for `received_at`.
pub const RECEIVED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reshapes a record before it is written to a shard.
///
/// A rejected record fails the pipeline run.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn apply(&self, record: Record) -> Result<Record, TransformError>;
}

#[async_trait]
impl<F> Transform for F
where
    F: Fn(Record) -> Result<Record, TransformError> + Send + Sync,
{
    async fn apply(&self, record: Record) -> Result<Record, TransformError> {
        self(record)
    }
}

/// Adds an `id` (random UUID) and a UTC `received_at` to every record.
///
/// Fields already present are kept, so replayed records keep their identity.
#[derive(Debug, Clone, Default)]
pub struct StampTransform {
    id_column: Option<String>,
}

impl StampTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the generated id into `column` instead of `id`
    pub fn with_id_column(column: impl Into<String>) -> Self {
        Self {
            id_column: Some(column.into()),
        }
    }
}

#[async_trait]
impl Transform for StampTransform {
    async fn apply(&self, mut record: Record) -> Result<Record, TransformError> {
        let column = self.id_column.as_deref().unwrap_or("id");
        record
            .entry(column.to_string())
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        record
            .entry("received_at".to_string())
            .or_insert_with(|| Value::String(Utc::now().format(RECEIVED_AT_FORMAT).to_string()));
        Ok(record)
    }
}

//! Stageload
//!
//! Bulk-loads JSON records into an analytical warehouse by staging them in
//! object storage first.
//!
//! # Pipeline
//!
//! - **Sharding**: records are spread round-robin over a fixed number of
//!   gzip-compressed NDJSON shards ([`shard`])
//! - **Staging**: finalized shards and a `COPY` manifest are uploaded
//!   concurrently to S3 ([`staging`], [`storage`])
//! - **Loading**: a single transaction copies the batch into a temporary
//!   table, replaces matching rows in the target table, and is retried on
//!   serializable-isolation conflicts ([`warehouse`])
//!
//! # Example
//!
//! ```no_run
//! use stageload::{LoadPipeline, PipelineConfig, StampTransform};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!     let mut pipeline = LoadPipeline::from_config(config)
//!         .transform(StampTransform::new())
//!         .build()?;
//!
//!     if let Some(record) = json!({"event": "signup"}).as_object() {
//!         pipeline.write(record.clone()).await?;
//!     }
//!     let report = pipeline.finish().await?;
//!     println!("loaded {} records", report.records);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod shard;
pub mod staging;
pub mod storage;
pub mod transform;
pub mod warehouse;

pub use config::PipelineConfig;
pub use error::{
    log_reporter, ConfigError, ErrorReporter, LoadError, PipelineError, PipelineResult,
    RollbackError, StorageError, TransformError,
};
pub use pipeline::{LoadPipeline, LoadPipelineBuilder, LoadReport, PipelineState};
pub use stageload_common::Record;
pub use storage::{MemoryStore, ObjectStore, S3Store, StorageConfig};
pub use transform::{StampTransform, Transform};
pub use warehouse::{PgWarehouse, WarehouseClient, WarehouseConfig, WarehouseError, WarehouseSession};

//! The staged-load pipeline
//!
//! One [`LoadPipeline`] carries one batch through:
//!
//! ```text
//! Idle -> Writing -> Finalizing -> Staging -> Loading -> Completed
//!                        |                                  ^
//!                        +------ no records written --------+
//! ```
//!
//! Any failure moves the run to `Failed`. A pipeline is single-use:
//! [`LoadPipeline::finish`] consumes it.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use stageload_common::Record;

use crate::config::PipelineConfig;
use crate::error::{log_reporter, ErrorReporter, PipelineError, PipelineResult};
use crate::shard::ShardedBufferWriter;
use crate::staging::{StagingLayout, StagingUploader};
use crate::storage::{ObjectStore, S3Store};
use crate::transform::Transform;
use crate::warehouse::{CopyCredentials, PgWarehouse, WarehouseClient, WarehouseLoader};

/// Lifecycle of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Writing,
    Finalizing,
    Staging,
    Loading,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Writing => "writing",
            PipelineState::Finalizing => "finalizing",
            PipelineState::Staging => "staging",
            PipelineState::Loading => "loading",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub records: u64,
    /// Records per shard, by shard index
    pub shard_records: Vec<u64>,
    pub shard_urls: Vec<String>,
    /// `None` when nothing was written and staging was skipped
    pub manifest_url: Option<String>,
    /// Load transaction attempts, 0 when skipped
    pub attempts: u32,
    pub staging_table: Option<String>,
}

impl LoadReport {
    fn empty(shard_count: usize) -> Self {
        Self {
            records: 0,
            shard_records: vec![0; shard_count],
            shard_urls: Vec::new(),
            manifest_url: None,
            attempts: 0,
            staging_table: None,
        }
    }

    /// True when the run had no records and never touched storage or the
    /// warehouse
    pub fn skipped(&self) -> bool {
        self.manifest_url.is_none()
    }
}

/// Builder for [`LoadPipeline`]
pub struct LoadPipelineBuilder {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn WarehouseClient>,
    transform: Option<Arc<dyn Transform>>,
    reporter: Option<ErrorReporter>,
}

impl LoadPipelineBuilder {
    /// Applied to every record before it is sharded
    pub fn transform(mut self, transform: impl Transform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Receives rollback and session-close failures; they are logged when
    /// no reporter is set
    pub fn on_error(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Validate the configuration and allocate the shards.
    pub fn build(self) -> PipelineResult<LoadPipeline> {
        let config = self.config;
        config.validate()?;

        let writer = ShardedBufferWriter::new(config.shards, config.staging_dir.as_deref())
            .map_err(PipelineError::Shard)?;

        let layout = StagingLayout::new(&config.storage.prefix, config.key_formatter.as_ref());
        let uploader = StagingUploader::new(self.store, layout);

        let credentials = CopyCredentials {
            access_key_id: config.storage.access_key_id.clone(),
            secret_access_key: config.storage.secret_access_key.clone(),
        };
        let loader = WarehouseLoader::new(
            self.warehouse,
            config.warehouse.table.clone(),
            credentials,
            self.reporter.unwrap_or_else(log_reporter),
        )
        .id_column(config.warehouse.id_column.clone())
        .max_errors(config.max_errors)
        .retry_policy(config.retry_policy());

        info!(
            shards = config.shards,
            table = %config.warehouse.table,
            root = %uploader.layout().root(),
            "Load pipeline ready"
        );

        Ok(LoadPipeline {
            state: PipelineState::Idle,
            writer,
            uploader,
            loader,
            transform: self.transform,
            failure: None,
        })
    }
}

/// Shards records, stages them, and merges them into the target table.
///
/// Writes are sequential (`&mut self`); wrap the pipeline in a lock or feed
/// it from a single task when records come from several producers.
pub struct LoadPipeline {
    state: PipelineState,
    writer: ShardedBufferWriter,
    uploader: StagingUploader,
    loader: WarehouseLoader,
    transform: Option<Arc<dyn Transform>>,
    /// First write error; the run is over once this is set
    failure: Option<PipelineError>,
}

impl fmt::Debug for LoadPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadPipeline")
            .field("state", &self.state)
            .field("writer", &self.writer)
            .field("table", &self.loader.table())
            .field("transform", &self.transform.is_some())
            .finish_non_exhaustive()
    }
}

impl LoadPipeline {
    pub fn builder(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn WarehouseClient>,
    ) -> LoadPipelineBuilder {
        LoadPipelineBuilder {
            config,
            store,
            warehouse,
            transform: None,
            reporter: None,
        }
    }

    /// Builder backed by S3 and a Postgres-protocol warehouse from `config`
    pub fn from_config(config: PipelineConfig) -> LoadPipelineBuilder {
        let store = Arc::new(S3Store::new(&config.storage));
        let warehouse = Arc::new(PgWarehouse::new(&config.warehouse));
        Self::builder(config, store, warehouse)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn records_written(&self) -> u64 {
        self.writer.records_written()
    }

    /// Transform `record` and route it to the next shard.
    ///
    /// Returns the index of the receiving shard. A failure here fails the
    /// run: later writes return [`PipelineError::Aborted`] and
    /// [`finish`](Self::finish) returns the original error.
    pub async fn write(&mut self, record: Record) -> PipelineResult<usize> {
        if let Some(failure) = &self.failure {
            return Err(PipelineError::Aborted {
                reason: failure.to_string(),
            });
        }
        self.state = PipelineState::Writing;

        match self.transform_and_route(record).await {
            Ok(index) => Ok(index),
            Err(err) => {
                error!(error = %err, "Record write failed, aborting pipeline");
                self.state = PipelineState::Failed;
                self.failure = Some(replay(&err));
                Err(err)
            },
        }
    }

    /// Write every record in order; returns how many were written.
    pub async fn write_all<I>(&mut self, records: I) -> PipelineResult<u64>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut written = 0;
        for record in records {
            self.write(record).await?;
            written += 1;
        }
        Ok(written)
    }

    async fn transform_and_route(&mut self, record: Record) -> PipelineResult<usize> {
        let record = match &self.transform {
            Some(transform) => transform.apply(record).await?,
            None => record,
        };
        self.writer.route(&record)
    }

    /// End input and run the batch to a terminal state.
    #[instrument(skip(self), fields(table = %self.loader.table()))]
    pub async fn finish(self) -> PipelineResult<LoadReport> {
        let LoadPipeline {
            state,
            writer,
            uploader,
            loader,
            failure,
            ..
        } = self;

        if let Some(err) = failure {
            return Err(err);
        }

        let mut run = Run { state };
        let shard_count = writer.shard_count();

        run.enter(PipelineState::Finalizing);
        let shards = writer
            .finalize_all()
            .await
            .map_err(|e| run.fail(PipelineError::Shard(e)))?;

        let shard_records: Vec<u64> = shards.iter().map(|s| s.records).collect();
        let records: u64 = shard_records.iter().sum();

        if records == 0 {
            run.enter(PipelineState::Completed);
            info!("No records written, skipping staging and load");
            return Ok(LoadReport::empty(shard_count));
        }

        run.enter(PipelineState::Staging);
        let batch = uploader
            .stage(&shards)
            .await
            .map_err(|e| run.fail(PipelineError::Upload(e)))?;
        // Local shard files are no longer needed once staged.
        drop(shards);

        run.enter(PipelineState::Loading);
        let outcome = loader
            .load(&batch.manifest_url)
            .await
            .map_err(|e| run.fail(PipelineError::Load(e)))?;

        run.enter(PipelineState::Completed);
        info!(
            records,
            attempts = outcome.attempts,
            manifest = %batch.manifest_url,
            "Load pipeline completed"
        );

        Ok(LoadReport {
            records,
            shard_records,
            shard_urls: batch.shard_urls,
            manifest_url: Some(batch.manifest_url),
            attempts: outcome.attempts,
            staging_table: Some(outcome.staging_table),
        })
    }
}

/// Same kind and message as `err`, for handing a write failure out twice.
///
/// Only errors a write can produce keep their variant.
fn replay(err: &PipelineError) -> PipelineError {
    match err {
        PipelineError::Transform(e) => PipelineError::Transform(e.clone()),
        PipelineError::Shard(e) => {
            PipelineError::Shard(std::io::Error::new(e.kind(), e.to_string()))
        },
        other => PipelineError::Aborted {
            reason: other.to_string(),
        },
    }
}

/// State tracking for [`LoadPipeline::finish`], after the pipeline is taken
/// apart.
struct Run {
    state: PipelineState,
}

impl Run {
    fn enter(&mut self, next: PipelineState) {
        debug!(from = %self.state, to = %next, "Pipeline state transition");
        self.state = next;
    }

    fn fail(&mut self, err: PipelineError) -> PipelineError {
        error!(state = %self.state, error = %err, "Load pipeline failed");
        self.state = PipelineState::Failed;
        err
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::TransformError;
    use crate::shard::BrokenSink;
    use crate::storage::{MemoryStore, StorageConfig};
    use crate::warehouse::{WarehouseConfig, WarehouseError, WarehouseSession};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Warehouse that only counts connection attempts
    #[derive(Default)]
    struct CountingWarehouse {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl WarehouseClient for CountingWarehouse {
        async fn connect(&self) -> Result<Box<dyn WarehouseSession>, WarehouseError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Err(WarehouseError::new("not reachable in unit tests"))
        }
    }

    fn setup(shards: usize) -> (Arc<MemoryStore>, Arc<CountingWarehouse>, LoadPipelineBuilder) {
        let mut config = PipelineConfig::new(
            StorageConfig::for_minio("http://localhost:9000", "staging"),
            WarehouseConfig::new("postgres://localhost:5439/dev", "events"),
        );
        config.shards = shards;

        let store = Arc::new(MemoryStore::new("staging"));
        let warehouse = Arc::new(CountingWarehouse::default());
        let builder = LoadPipeline::builder(config, store.clone(), warehouse.clone());
        (store, warehouse, builder)
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_sink_error_fails_the_run() {
        let (store, warehouse, builder) = setup(2);
        let mut pipeline = builder.build().unwrap();
        pipeline.writer.replace_sink(1, Box::new(BrokenSink));

        let err = pipeline.write(record(json!({"id": 1}))).await.unwrap_err();
        assert!(matches!(err, PipelineError::Shard(_)));
        assert_eq!(pipeline.state(), PipelineState::Failed);

        let err = pipeline.write(record(json!({"id": 2}))).await.unwrap_err();
        assert!(matches!(err, PipelineError::Aborted { .. }));

        match pipeline.finish().await.unwrap_err() {
            PipelineError::Shard(e) => assert!(e.to_string().contains("no space left on device")),
            other => panic!("expected shard error, got {:?}", other),
        }
        assert!(store.is_empty());
        assert_eq!(warehouse.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finalize_error_fails_finish() {
        let (store, warehouse, builder) = setup(3);
        let mut pipeline = builder.build().unwrap();
        pipeline.write(record(json!({"id": 1}))).await.unwrap();
        pipeline.writer.replace_sink(0, Box::new(BrokenSink));

        let err = pipeline.finish().await.unwrap_err();
        assert!(matches!(err, PipelineError::Shard(_)));
        assert!(store.is_empty());
        assert_eq!(warehouse.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finish_returns_the_transform_error() {
        let (_, _, builder) = setup(1);
        let reject = |_: Record| -> Result<Record, TransformError> {
            Err(TransformError::new("bad record"))
        };
        let mut pipeline = builder.transform(reject).build().unwrap();

        let err = pipeline.write(record(json!({"id": 1}))).await.unwrap_err();
        assert_eq!(err.to_string(), "Transform rejected record: bad record");

        match pipeline.finish().await.unwrap_err() {
            PipelineError::Transform(e) => assert_eq!(e.message, "bad record"),
            other => panic!("expected transform error, got {:?}", other),
        }
    }

    #[test]
    fn test_replay_keeps_kind() {
        let err = PipelineError::Shard(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "disk full",
        ));
        match replay(&err) {
            PipelineError::Shard(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied);
                assert_eq!(e.to_string(), "disk full");
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PipelineState::Idle.to_string(), "idle");
        assert_eq!(PipelineState::Finalizing.to_string(), "finalizing");
        assert_eq!(
            serde_json::to_string(&PipelineState::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn test_empty_report_is_skipped() {
        let report = LoadReport::empty(3);
        assert!(report.skipped());
        assert_eq!(report.shard_records, vec![0, 0, 0]);
        assert_eq!(report.attempts, 0);
    }
}

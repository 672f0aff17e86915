//! Common test utilities for stageload integration tests
//!
//! - [`FakeWarehouse`]: an in-process warehouse that understands the load
//!   transaction's statements, reads staged batches out of a
//!   [`MemoryStore`], and can be scripted to fail
//! - [`FailingStore`]: an object store whose puts fail for matching keys
//! - [`pipeline_config`]: a valid configuration for a given shard count

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stageload::storage::{MemoryStore, ObjectStore, StorageConfig};
use stageload::warehouse::{WarehouseClient, WarehouseConfig, WarehouseError, WarehouseSession};
use stageload::{PipelineConfig, Record, StorageError};
use stageload_common::types::parse_record;
use stageload_common::Manifest;

pub const TEST_BUCKET: &str = "stageload-test";
pub const TEST_TABLE: &str = "events";

/// Text of a Redshift serializable-isolation cycle conflict
pub fn conflict_error() -> WarehouseError {
    WarehouseError::new(
        "1023 DETAIL: Serializable isolation violation on table - 156569, \
         transactions forming the cycle are: 1215, 1213 (pid:28611)",
    )
    .with_code("XX000")
}

/// Valid configuration with the given shard count and a 1s backoff base
pub fn pipeline_config(shards: usize) -> PipelineConfig {
    let mut storage = StorageConfig::for_minio("http://localhost:9000", TEST_BUCKET);
    storage.prefix = "events/".to_string();

    let mut config = PipelineConfig::new(
        storage,
        WarehouseConfig::new("postgres://loader@localhost:5439/dev", TEST_TABLE),
    );
    config.shards = shards;
    config.retry_base = Duration::from_secs(1);
    config
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("record must be a JSON object")
}

/// Decompress a staged shard into its records
pub fn decode_shard(body: &[u8]) -> Vec<Record> {
    let mut text = String::new();
    MultiGzDecoder::new(body).read_to_string(&mut text).unwrap();
    text.lines().map(|line| parse_record(line).unwrap()).collect()
}

// ============================================================================
// Fake Warehouse
// ============================================================================

/// What the fake warehouse saw, shared by all of its sessions
#[derive(Debug, Default)]
pub struct WarehouseLog {
    pub connects: usize,
    pub begins: usize,
    pub statements: Vec<String>,
    pub staging_tables: Vec<String>,
    pub commits: usize,
    pub rollbacks: usize,
    pub closes: usize,
}

#[derive(Default)]
struct Shared {
    log: WarehouseLog,
    /// Committed contents of the target table
    rows: Vec<Record>,
    /// Per-connect outcome: `Some(err)` fails that attempt at commit
    script: VecDeque<Option<WarehouseError>>,
    /// Fails every attempt at commit once the script is exhausted
    always_fail: Option<WarehouseError>,
    rollback_error: Option<WarehouseError>,
}

/// Warehouse double that executes the load statements against in-memory
/// tables
#[derive(Clone)]
pub struct FakeWarehouse {
    store: Arc<MemoryStore>,
    shared: Arc<Mutex<Shared>>,
}

impl FakeWarehouse {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Queue per-attempt outcomes, in connect order
    pub fn script(self, outcomes: impl IntoIterator<Item = Option<WarehouseError>>) -> Self {
        self.shared.lock().unwrap().script.extend(outcomes);
        self
    }

    pub fn always_fail(self, error: WarehouseError) -> Self {
        self.shared.lock().unwrap().always_fail = Some(error);
        self
    }

    pub fn rollback_fails(self, error: WarehouseError) -> Self {
        self.shared.lock().unwrap().rollback_error = Some(error);
        self
    }

    pub fn seed(self, rows: impl IntoIterator<Item = Record>) -> Self {
        self.shared.lock().unwrap().rows.extend(rows);
        self
    }

    pub fn rows(&self) -> Vec<Record> {
        self.shared.lock().unwrap().rows.clone()
    }

    pub fn with_log<T>(&self, f: impl FnOnce(&WarehouseLog) -> T) -> T {
        f(&self.shared.lock().unwrap().log)
    }

    pub fn connects(&self) -> usize {
        self.with_log(|log| log.connects)
    }
}

#[async_trait]
impl WarehouseClient for FakeWarehouse {
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>, WarehouseError> {
        let mut shared = self.shared.lock().unwrap();
        shared.log.connects += 1;
        let fail_at_commit = match shared.script.pop_front() {
            Some(outcome) => outcome,
            None => shared.always_fail.clone(),
        };
        drop(shared);

        Ok(Box::new(FakeSession {
            store: self.store.clone(),
            shared: self.shared.clone(),
            working: None,
            temp: HashMap::new(),
            fail_at_commit,
        }))
    }
}

struct FakeSession {
    store: Arc<MemoryStore>,
    shared: Arc<Mutex<Shared>>,
    /// Target table as seen inside the open transaction
    working: Option<Vec<Record>>,
    temp: HashMap<String, Vec<Record>>,
    fail_at_commit: Option<WarehouseError>,
}

impl FakeSession {
    fn working(&mut self) -> Result<&mut Vec<Record>, WarehouseError> {
        self.working
            .as_mut()
            .ok_or_else(|| WarehouseError::new("no transaction in progress"))
    }

    fn copy(&mut self, statement: &str) -> Result<u64, WarehouseError> {
        let mut lines = statement.lines();
        let table = lines
            .next()
            .and_then(|l| l.strip_prefix("COPY "))
            .ok_or_else(|| WarehouseError::new("malformed COPY"))?
            .to_string();
        let url = lines
            .next()
            .and_then(|l| l.strip_prefix("FROM '"))
            .and_then(|l| l.strip_suffix('\''))
            .ok_or_else(|| WarehouseError::new("malformed COPY source"))?;

        let manifest = self
            .store
            .get_url(url)
            .ok_or_else(|| WarehouseError::new(format!("manifest {} not found", url)))?;
        let manifest: Manifest = serde_json::from_slice(&manifest.body)
            .map_err(|e| WarehouseError::new(format!("bad manifest: {}", e)))?;

        let mut loaded = Vec::new();
        for entry in &manifest.entries {
            match self.store.get_url(&entry.url) {
                Some(object) => loaded.extend(decode_shard(&object.body)),
                None if entry.mandatory => {
                    return Err(WarehouseError::new(format!(
                        "mandatory manifest entry {} not found",
                        entry.url
                    )))
                },
                None => {},
            }
        }

        let count = loaded.len() as u64;
        self.temp
            .get_mut(&table)
            .ok_or_else(|| WarehouseError::new(format!("relation \"{}\" does not exist", table)))?
            .extend(loaded);
        Ok(count)
    }
}

#[async_trait]
impl WarehouseSession for FakeSession {
    async fn begin(&mut self) -> Result<(), WarehouseError> {
        let mut shared = self.shared.lock().unwrap();
        shared.log.begins += 1;
        self.working = Some(shared.rows.clone());
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, WarehouseError> {
        self.shared.lock().unwrap().log.statements.push(sql.to_string());
        let words: Vec<&str> = sql.split_whitespace().collect();

        match words.as_slice() {
            ["CREATE", "TEMP", "TABLE", name, ..] => {
                let name = name.to_string();
                if self.temp.contains_key(&name) {
                    return Err(WarehouseError::new(format!(
                        "relation \"{}\" already exists",
                        name
                    )));
                }
                self.shared.lock().unwrap().log.staging_tables.push(name.clone());
                self.temp.insert(name, Vec::new());
                Ok(0)
            },
            ["COPY", ..] => self.copy(sql),
            ["DELETE", "FROM", _, "WHERE", column, "IN", "(SELECT", _, "FROM", staging] => {
                let column = column.to_string();
                let staging = staging.trim_end_matches(')');
                let ids: HashSet<String> = self
                    .temp
                    .get(staging)
                    .ok_or_else(|| WarehouseError::new("unknown staging table"))?
                    .iter()
                    .filter_map(|r| r.get(&column).map(Value::to_string))
                    .collect();
                let rows = self.working()?;
                let before = rows.len();
                rows.retain(|r| r.get(&column).map_or(true, |v| !ids.contains(&v.to_string())));
                Ok((before - rows.len()) as u64)
            },
            ["INSERT", "INTO", _, "SELECT", "*", "FROM", staging] => {
                let staged = self
                    .temp
                    .get(*staging)
                    .cloned()
                    .ok_or_else(|| WarehouseError::new("unknown staging table"))?;
                let count = staged.len() as u64;
                self.working()?.extend(staged);
                Ok(count)
            },
            ["DROP", "TABLE", name] => {
                self.temp.remove(*name);
                Ok(0)
            },
            _ => Err(WarehouseError::new(format!("unsupported statement: {}", sql))),
        }
    }

    async fn commit(&mut self) -> Result<(), WarehouseError> {
        if let Some(error) = self.fail_at_commit.take() {
            return Err(error);
        }
        let rows = self
            .working
            .take()
            .ok_or_else(|| WarehouseError::new("no transaction in progress"))?;
        let mut shared = self.shared.lock().unwrap();
        shared.rows = rows;
        shared.log.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), WarehouseError> {
        self.working = None;
        self.temp.clear();
        let mut shared = self.shared.lock().unwrap();
        shared.log.rollbacks += 1;
        match shared.rollback_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), WarehouseError> {
        self.shared.lock().unwrap().log.closes += 1;
        Ok(())
    }
}

// ============================================================================
// Failing Store
// ============================================================================

/// Object store that rejects puts whose key contains `fail_on`
pub struct FailingStore {
    inner: MemoryStore,
    fail_on: String,
    pub attempts: AtomicUsize,
}

impl FailingStore {
    pub fn new(fail_on: impl Into<String>) -> Self {
        Self {
            inner: MemoryStore::new(TEST_BUCKET),
            fail_on: fail_on.into(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl ObjectStore for FailingStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<(), StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if key.contains(&self.fail_on) {
            return Err(StorageError::Put {
                key: key.to_string(),
                message: "access denied".to_string(),
            });
        }
        self.inner.put(key, body, content_type, content_encoding).await
    }
}

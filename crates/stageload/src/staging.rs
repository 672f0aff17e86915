//! Staging finalized shards and their manifest in object storage
//!
//! Every batch lives under one key root:
//!
//! ```text
//! {prefix}{YYYY/MM/DD/HH/mm}/{uuid}/0.json.gz
//! {prefix}{YYYY/MM/DD/HH/mm}/{uuid}/1.json.gz
//! ...
//! {prefix}{YYYY/MM/DD/HH/mm}/{uuid}/manifest.json
//! ```
//!
//! The time bucket is UTC; the UUID keeps concurrent runs sharing a prefix
//! apart.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use stageload_common::types::Manifest;

use crate::error::StorageError;
use crate::shard::FinalizedShard;
use crate::storage::ObjectStore;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const GZIP_CONTENT_ENCODING: &str = "gzip";

/// Custom key-root naming: receives the configured prefix, returns the root
/// under which shards and the manifest are written.
pub type KeyFormatter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Key layout of one staged batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    root: String,
}

impl StagingLayout {
    /// Layout rooted at `formatter(prefix)`, or the default time-bucketed root.
    pub fn new(prefix: &str, formatter: Option<&KeyFormatter>) -> Self {
        let root = match formatter {
            Some(format) => format(prefix),
            None => Self::default_root(prefix, Utc::now(), Uuid::new_v4()),
        };
        Self::with_root(root)
    }

    pub fn with_root(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    /// `{prefix}/YYYY/MM/DD/HH/mm/{id}`; a missing trailing slash on a
    /// non-empty prefix is added.
    pub fn default_root(prefix: &str, now: DateTime<Utc>, id: Uuid) -> String {
        let mut root = prefix.to_string();
        if !root.is_empty() && !root.ends_with('/') {
            root.push('/');
        }
        root.push_str(&now.format("%Y/%m/%d/%H/%M/").to_string());
        root.push_str(&id.to_string());
        root
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn shard_key(&self, index: usize) -> String {
        format!("{}/{}.json.gz", self.root, index)
    }

    pub fn manifest_key(&self) -> String {
        format!("{}/manifest.json", self.root)
    }
}

/// Locations of a successfully staged batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBatch {
    pub shard_urls: Vec<String>,
    pub manifest_url: String,
}

/// Uploads shard files and the manifest for one pipeline run
#[derive(Clone)]
pub struct StagingUploader {
    store: Arc<dyn ObjectStore>,
    layout: StagingLayout,
}

impl StagingUploader {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StagingLayout) -> Self {
        Self { store, layout }
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    /// URLs the shards will have once uploaded, in shard order
    pub fn shard_urls(&self, count: usize) -> Vec<String> {
        (0..count)
            .map(|index| self.store.url_for(&self.layout.shard_key(index)))
            .collect()
    }

    /// Upload every shard concurrently; returns their URLs in shard order.
    pub async fn upload_shards(
        &self,
        shards: &[FinalizedShard],
    ) -> Result<Vec<String>, StorageError> {
        let uploads = shards.iter().map(|shard| async move {
            let key = self.layout.shard_key(shard.index);
            let body = shard.read_bytes().await?;
            debug!(
                shard = shard.index,
                records = shard.records,
                bytes = body.len(),
                key = %key,
                "Uploading shard"
            );
            self.store
                .put(&key, body, JSON_CONTENT_TYPE, Some(GZIP_CONTENT_ENCODING))
                .await?;
            Ok::<_, StorageError>(self.store.url_for(&key))
        });

        try_join_all(uploads).await
    }

    /// Upload the manifest listing `urls`; returns the manifest URL.
    pub async fn upload_manifest(&self, urls: &[String]) -> Result<String, StorageError> {
        let manifest = Manifest::from_urls(urls.iter().cloned());
        let body = manifest.to_json_pretty()?.into_bytes();
        let key = self.layout.manifest_key();

        self.store.put(&key, body, JSON_CONTENT_TYPE, None).await?;
        Ok(self.store.url_for(&key))
    }

    /// Upload shards and manifest concurrently; both must succeed.
    #[instrument(skip(self, shards), fields(root = %self.layout.root(), shards = shards.len()))]
    pub async fn stage(&self, shards: &[FinalizedShard]) -> Result<StagedBatch, StorageError> {
        let urls = self.shard_urls(shards.len());

        let (shard_urls, manifest_url) =
            tokio::try_join!(self.upload_shards(shards), self.upload_manifest(&urls))?;

        info!(manifest = %manifest_url, "Staged batch");

        Ok(StagedBatch {
            shard_urls,
            manifest_url,
        })
    }
}

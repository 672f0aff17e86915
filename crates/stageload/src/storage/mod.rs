//! Object storage for staged shards and manifests
//!
//! The pipeline only ever needs one operation from the blob store: a `put`
//! with a content type and an optional content encoding. [`S3Store`] talks to
//! S3 (or an S3-compatible endpoint); [`MemoryStore`] keeps objects in process
//! for tests.

use async_trait::async_trait;

use crate::error::StorageError;

pub mod config;
mod memory;
mod s3;

pub use config::StorageConfig;
pub use memory::{MemoryStore, StoredObject};
pub use s3::S3Store;

/// Minimal blob store used for staging
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket the keys live in; used to build `s3://` URLs for the warehouse
    fn bucket(&self) -> &str;

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<(), StorageError>;

    /// URL the warehouse uses to read `key`
    fn url_for(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket(), key)
    }
}

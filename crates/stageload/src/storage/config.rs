use serde::{Deserialize, Serialize};
use std::env;

use crate::error::ConfigError;

/// Default region for the staging bucket.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Staging bucket location and credentials.
///
/// The same credentials are handed to the warehouse `COPY`, so they must be
/// explicit keys rather than an ambient credential chain.
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub bucket: String,
    /// Key prefix for staged batches, e.g. "events/"
    pub prefix: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,
    pub path_style: bool,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            region: DEFAULT_S3_REGION.to_string(),
            endpoint: None,
            path_style: false,
            access_key_id: String::new(),
            secret_access_key: String::new(),
        }
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("path_style", &self.path_style)
            .field("access_key_id", &"<redacted>")
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bucket: env::var("STAGELOAD_S3_BUCKET")
                .map_err(|_| ConfigError::Missing("STAGELOAD_S3_BUCKET"))?,
            prefix: env::var("STAGELOAD_S3_PREFIX").unwrap_or_default(),
            region: env::var("STAGELOAD_S3_REGION")
                .unwrap_or_else(|_| DEFAULT_S3_REGION.to_string()),
            endpoint: env::var("STAGELOAD_S3_ENDPOINT").ok(),
            path_style: env::var("STAGELOAD_S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            access_key_id: env::var("STAGELOAD_S3_ACCESS_KEY_ID")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .map_err(|_| ConfigError::Missing("STAGELOAD_S3_ACCESS_KEY_ID"))?,
            secret_access_key: env::var("STAGELOAD_S3_SECRET_ACCESS_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .map_err(|_| ConfigError::Missing("STAGELOAD_S3_SECRET_ACCESS_KEY"))?,
        })
    }

    /// Local MinIO with its stock credentials
    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: Some(endpoint.into()),
            path_style: true,
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin".to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::Missing("storage.bucket"));
        }
        if self.bucket.contains('/') {
            return Err(ConfigError::invalid(
                "storage.bucket",
                "bucket names cannot contain '/'",
            ));
        }
        if self.access_key_id.is_empty() {
            return Err(ConfigError::Missing("storage.access_key_id"));
        }
        if self.secret_access_key.is_empty() {
            return Err(ConfigError::Missing("storage.secret_access_key"));
        }
        Ok(())
    }
}

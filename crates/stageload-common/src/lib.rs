//! Stageload Common Library
//!
//! Shared types, logging, and error handling for the stageload workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Types**: records, load manifests, and warehouse identifier checks
//!
//! # Example
//!
//! ```no_run
//! use stageload_common::types::{Manifest, ManifestEntry};
//!
//! fn build() -> stageload_common::Result<String> {
//!     let manifest = Manifest::new(vec![ManifestEntry::mandatory("s3://bucket/events/0.json.gz")]);
//!     manifest.to_json_pretty()
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{Manifest, ManifestEntry, Record};

//! Common types used across stageload

use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::error::{CommonError, Result};

/// A single structured record.
///
/// The loader never looks inside a record; the shape is whatever the producer
/// (and the optional transform) hands over.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Parse one line of newline-delimited JSON into a [`Record`].
pub fn parse_record(line: &str) -> Result<Record> {
    match serde_json::from_str::<serde_json::Value>(line)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(CommonError::NotAnObject(truncate(&other.to_string(), 64))),
    }
}

/// Serialize a record as a single NDJSON line, newline included.
pub fn to_ndjson_line(record: &Record) -> Result<String> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

// ============================================================================
// Load Manifest
// ============================================================================

/// Load manifest listing every staged shard of one batch.
///
/// Serialized as `{"entries": [{"url": "...", "mandatory": true}, ...]}`,
/// which is the format the warehouse `COPY ... MANIFEST` command reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

/// One staged object in a [`Manifest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    pub mandatory: bool,
}

impl ManifestEntry {
    /// Entry the warehouse must find, failing the load otherwise
    pub fn mandatory(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mandatory: true,
        }
    }
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Build a manifest with one mandatory entry per URL, in the given order.
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(urls.into_iter().map(ManifestEntry::mandatory).collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ============================================================================
// Warehouse Identifiers
// ============================================================================

#[allow(clippy::expect_used)]
static IDENTIFIER: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("identifier pattern is valid")
});

/// Check that `name` is a plain `[schema.]table` identifier.
///
/// Table and column names are interpolated into SQL text, so anything beyond
/// letters, digits, underscores and a single schema dot is refused.
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(CommonError::InvalidIdentifier(name.to_string()))
    }
}

/// Unqualified part of a `[schema.]table` identifier.
pub fn unqualified(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

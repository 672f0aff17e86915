//! Warehouse access and the staged-swap load
//!
//! - [`WarehouseClient`] / [`WarehouseSession`]: the SQL surface the loader
//!   needs (`begin`, `execute`, `commit`, `rollback`, `close`)
//! - [`PgWarehouse`]: Postgres wire protocol implementation (Redshift)
//! - [`WarehouseLoader`]: the load transaction with conflict retries
//! - [`RetryPolicy`]: which failures are retried, and after how long

use async_trait::async_trait;
use thiserror::Error;

pub mod config;
mod loader;
mod postgres;
mod retry;

pub use config::WarehouseConfig;
pub use loader::{
    CopyCredentials, LoadOutcome, LoadTransaction, WarehouseLoader, DEFAULT_MAX_ERRORS,
};
pub use postgres::PgWarehouse;
pub use retry::{RetryDecision, RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE};

/// Error reported by the warehouse, with its diagnostic text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct WarehouseError {
    pub message: String,
    /// SQLSTATE or vendor code, when the server supplied one
    pub code: Option<String>,
}

impl WarehouseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Opens sessions against the warehouse
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>, WarehouseError>;
}

/// One connection; statements run in order
#[async_trait]
pub trait WarehouseSession: Send {
    async fn begin(&mut self) -> Result<(), WarehouseError>;

    /// Run one statement; returns rows affected
    async fn execute(&mut self, sql: &str) -> Result<u64, WarehouseError>;

    async fn commit(&mut self) -> Result<(), WarehouseError>;

    async fn rollback(&mut self) -> Result<(), WarehouseError>;

    async fn close(self: Box<Self>) -> Result<(), WarehouseError>;
}

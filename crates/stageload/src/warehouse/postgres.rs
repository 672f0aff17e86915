use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgDatabaseError};
use sqlx::{Connection, Executor};
use std::time::Duration;
use tracing::{debug, instrument};

use super::{config::WarehouseConfig, WarehouseClient, WarehouseError, WarehouseSession};

impl From<sqlx::Error> for WarehouseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                // Redshift puts the useful part ("Serializable isolation
                // violation ...") in DETAIL, not in the primary message.
                let mut message = db.message().to_string();
                if let Some(detail) = db
                    .try_downcast_ref::<PgDatabaseError>()
                    .and_then(PgDatabaseError::detail)
                {
                    message.push_str(" DETAIL: ");
                    message.push_str(detail);
                }
                WarehouseError {
                    message,
                    code: db.code().map(|c| c.into_owned()),
                }
            },
            _ => WarehouseError::new(err.to_string()),
        }
    }
}

/// Warehouse reached over the Postgres wire protocol.
///
/// Each load attempt gets its own connection, so a connection left in an
/// aborted transaction is never reused.
#[derive(Clone)]
pub struct PgWarehouse {
    url: String,
    connect_timeout: Duration,
}

impl std::fmt::Debug for PgWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgWarehouse")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl PgWarehouse {
    pub fn new(config: &WarehouseConfig) -> Self {
        Self {
            url: config.url.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

#[async_trait]
impl WarehouseClient for PgWarehouse {
    #[instrument(skip(self))]
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>, WarehouseError> {
        let conn = tokio::time::timeout(self.connect_timeout, PgConnection::connect(&self.url))
            .await
            .map_err(|_| {
                WarehouseError::new(format!(
                    "Timed out connecting to warehouse after {:?}",
                    self.connect_timeout
                ))
            })??;

        debug!("Warehouse connection established");
        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: PgConnection,
}

impl PgSession {
    /// A bare `&str` has no bind arguments, so this goes out as a simple
    /// query and may hold several statements.
    async fn run(&mut self, sql: &str) -> Result<u64, WarehouseError> {
        let result = Executor::execute(&mut self.conn, sql).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WarehouseSession for PgSession {
    async fn begin(&mut self) -> Result<(), WarehouseError> {
        self.run("BEGIN TRANSACTION").await.map(|_| ())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, WarehouseError> {
        self.run(sql).await
    }

    async fn commit(&mut self) -> Result<(), WarehouseError> {
        self.run("END TRANSACTION").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), WarehouseError> {
        self.run("ROLLBACK").await.map(|_| ())
    }

    async fn close(self: Box<Self>) -> Result<(), WarehouseError> {
        self.conn.close().await.map_err(WarehouseError::from)
    }
}

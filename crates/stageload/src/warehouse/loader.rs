use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use stageload_common::types::unqualified;

use super::{RetryDecision, RetryPolicy, WarehouseClient, WarehouseError, WarehouseSession};
use crate::error::{ErrorReporter, LoadError, RollbackError};

/// Default number of malformed rows `COPY` tolerates.
pub const DEFAULT_MAX_ERRORS: u64 = 100_000;

/// Keys the warehouse uses to read the staged objects
#[derive(Clone, PartialEq, Eq)]
pub struct CopyCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl CopyCredentials {
    fn clause(&self) -> String {
        format!(
            "aws_access_key_id={};aws_secret_access_key={}",
            self.access_key_id, self.secret_access_key
        )
    }
}

impl std::fmt::Debug for CopyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CopyCredentials(<redacted>)")
    }
}

fn quote(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

/// One attempt at the staged swap.
///
/// The staging table name is fresh for every attempt: an aborted earlier
/// attempt may have left its table behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTransaction {
    pub staging_table: String,
    pub target_table: String,
    pub manifest_url: String,
}

impl LoadTransaction {
    pub fn new(target_table: &str, manifest_url: &str) -> Self {
        Self {
            staging_table: format!(
                "{}_temp_{}",
                unqualified(target_table),
                Uuid::new_v4().simple()
            ),
            target_table: target_table.to_string(),
            manifest_url: manifest_url.to_string(),
        }
    }

    /// Statements run between `BEGIN` and `END`, in order
    pub fn statements(
        &self,
        id_column: &str,
        credentials: &CopyCredentials,
        max_errors: Option<u64>,
    ) -> Vec<String> {
        let staging = &self.staging_table;
        let target = &self.target_table;

        let mut copy = format!(
            "COPY {staging}\nFROM {}\nCREDENTIALS {}\nMANIFEST\nFORMAT AS JSON 'auto'\nGZIP\nTRUNCATECOLUMNS",
            quote(&self.manifest_url),
            quote(&credentials.clause()),
        );
        if let Some(max) = max_errors {
            copy.push_str(&format!("\nMAXERROR {}", max));
        }

        vec![
            format!("CREATE TEMP TABLE {staging} (LIKE {target})"),
            copy,
            format!("DELETE FROM {target}\nWHERE {id_column} IN (SELECT {id_column} FROM {staging})"),
            format!("INSERT INTO {target}\nSELECT * FROM {staging}"),
            format!("DROP TABLE {staging}"),
        ]
    }
}

/// Result of a successful load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Transaction attempts, including the successful one
    pub attempts: u32,
    pub staging_table: String,
}

/// Merges a staged batch into the target table.
///
/// One transaction at a time; conflicts are retried sequentially with the
/// backoff of the [`RetryPolicy`].
pub struct WarehouseLoader {
    client: Arc<dyn WarehouseClient>,
    table: String,
    id_column: String,
    credentials: CopyCredentials,
    max_errors: Option<u64>,
    policy: RetryPolicy,
    reporter: ErrorReporter,
}

impl WarehouseLoader {
    pub fn new(
        client: Arc<dyn WarehouseClient>,
        table: impl Into<String>,
        credentials: CopyCredentials,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            client,
            table: table.into(),
            id_column: super::config::DEFAULT_ID_COLUMN.to_string(),
            credentials,
            max_errors: Some(DEFAULT_MAX_ERRORS),
            policy: RetryPolicy::default(),
            reporter,
        }
    }

    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    /// `None` omits `MAXERROR`, leaving the warehouse default
    pub fn max_errors(mut self, max_errors: Option<u64>) -> Self {
        self.max_errors = max_errors;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn load(&self, manifest_url: &str) -> Result<LoadOutcome, LoadError> {
        let mut retries = 0u32;

        loop {
            let tx = LoadTransaction::new(&self.table, manifest_url);
            let attempts = retries + 1;

            let error = match self.attempt(&tx).await {
                Ok(()) => {
                    info!(attempts, staging_table = %tx.staging_table, "Load committed");
                    return Ok(LoadOutcome {
                        attempts,
                        staging_table: tx.staging_table,
                    });
                },
                Err(error) => error,
            };

            match self.policy.should_retry(&error, retries) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        attempt = attempts,
                        max_retries = self.policy.max_retries(),
                        delay_secs = delay.as_secs_f64(),
                        error = %error,
                        "Load conflicted with a concurrent transaction, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                },
                RetryDecision::GiveUp if RetryPolicy::is_load_conflict(&error) => {
                    return Err(LoadError::RetriesExhausted {
                        attempts,
                        source: error,
                    });
                },
                RetryDecision::GiveUp => {
                    return Err(LoadError::Failed {
                        attempts,
                        source: error,
                    });
                },
            }
        }
    }

    /// Run one transaction on a fresh session, cleaning up on failure.
    async fn attempt(&self, tx: &LoadTransaction) -> Result<(), WarehouseError> {
        let mut session = self.client.connect().await?;
        let result = self.run(session.as_mut(), tx).await;

        if let Err(ref error) = result {
            debug!(error = %error, staging_table = %tx.staging_table, "Rolling back load");
            if let Err(source) = session.rollback().await {
                (self.reporter)(&RollbackError::Rollback {
                    staging_table: tx.staging_table.clone(),
                    source,
                });
            }
        }

        if let Err(source) = session.close().await {
            (self.reporter)(&RollbackError::Close { source });
        }

        result
    }

    async fn run(
        &self,
        session: &mut dyn WarehouseSession,
        tx: &LoadTransaction,
    ) -> Result<(), WarehouseError> {
        session.begin().await?;
        for statement in tx.statements(&self.id_column, &self.credentials, self.max_errors) {
            // First line only: the COPY credentials sit further down.
            debug!(statement = statement.lines().next().unwrap_or_default(), "Executing");
            session.execute(&statement).await?;
        }
        session.commit().await
    }
}

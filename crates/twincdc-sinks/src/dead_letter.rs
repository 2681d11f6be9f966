//! PostgreSQL-backed dead-letter store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};
use twincdc_core::{DeadLetterRecord, DeadLetterStatus, DeadLetterStore, Result, StoredDeadLetter, TwinCdcError};
use twincdc_shared::DeadLetterConfig;

/// Stores one row per undeliverable (event, sink) pair.
///
/// The schema, table and indexes are created on first use with
/// `IF NOT EXISTS`, so several processes may share one table.
pub struct PostgresDeadLetterStore {
    pool: PgPool,
    schema: String,
    table: String,
    initialized: OnceCell<()>,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool, config: &DeadLetterConfig) -> Result<Self> {
        validate_identifier(&config.schema)?;
        validate_identifier(&config.table)?;
        Ok(Self {
            pool,
            schema: config.schema.clone(),
            table: config.table.clone(),
            initialized: OnceCell::new(),
        })
    }

    /// Build a store with a lazily connecting pool; nothing touches the
    /// database until the first dead letter is written.
    pub fn connect_lazy(url: &str, config: &DeadLetterConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(url)
            .map_err(|e| TwinCdcError::DatabaseError(format!("Invalid dead-letter database URL: {}", e)))?;
        Self::new(pool, config)
    }

    fn qualified_table(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }

    fn schema_statements(&self) -> Vec<String> {
        let table = self.qualified_table();
        vec![
            format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id BIGSERIAL PRIMARY KEY, \
                 event_id TEXT NOT NULL, \
                 sink_name TEXT NOT NULL, \
                 event_type TEXT NOT NULL, \
                 payload JSONB NOT NULL, \
                 error_message TEXT NOT NULL, \
                 error_stack TEXT, \
                 retry_count INTEGER NOT NULL, \
                 failed_at TIMESTAMPTZ NOT NULL, \
                 last_attempt_at TIMESTAMPTZ NOT NULL, \
                 status TEXT NOT NULL DEFAULT 'pending')",
                table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS \"{}_status_idx\" ON {} (status, failed_at)",
                self.table, table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS \"{}_sink_idx\" ON {} (sink_name)",
                self.table, table
            ),
        ]
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                for statement in self.schema_statements() {
                    sqlx::query(&statement)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| TwinCdcError::DatabaseError(format!("Dead-letter schema setup failed: {}", e)))?;
                }
                info!(table = %self.qualified_table(), "Dead-letter table ready");
                Ok::<(), TwinCdcError>(())
            })
            .await?;
        Ok(())
    }

    fn row_to_record(row: &PgRow) -> Result<StoredDeadLetter> {
        let status: String = row.try_get("status").map_err(db_error)?;
        let retry_count: i32 = row.try_get("retry_count").map_err(db_error)?;
        let failed_at: DateTime<Utc> = row.try_get("failed_at").map_err(db_error)?;
        let last_attempt_at: DateTime<Utc> = row.try_get("last_attempt_at").map_err(db_error)?;

        Ok(StoredDeadLetter {
            id: row.try_get("id").map_err(db_error)?,
            record: DeadLetterRecord {
                event_id: row.try_get("event_id").map_err(db_error)?,
                sink_name: row.try_get("sink_name").map_err(db_error)?,
                event_type: row.try_get("event_type").map_err(db_error)?,
                payload: row.try_get("payload").map_err(db_error)?,
                error_message: row.try_get("error_message").map_err(db_error)?,
                error_stack: row.try_get("error_stack").map_err(db_error)?,
                retry_count: retry_count.max(0) as u32,
                failed_at,
                last_attempt_at,
                status: DeadLetterStatus::from_str(&status)?,
            },
        })
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    #[instrument(skip(self, record), fields(event_id = %record.event_id, sink = %record.sink_name))]
    async fn persist(&self, record: DeadLetterRecord) -> Result<()> {
        self.ensure_schema().await?;

        let sql = format!(
            "INSERT INTO {} (event_id, sink_name, event_type, payload, error_message, error_stack, \
             retry_count, failed_at, last_attempt_at, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            self.qualified_table()
        );
        sqlx::query(&sql)
            .bind(&record.event_id)
            .bind(&record.sink_name)
            .bind(&record.event_type)
            .bind(&record.payload)
            .bind(&record.error_message)
            .bind(&record.error_stack)
            .bind(record.retry_count.min(i32::MAX as u32) as i32)
            .bind(record.failed_at)
            .bind(record.last_attempt_at)
            .bind(record.status.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        debug!("Dead letter persisted");
        Ok(())
    }

    async fn list(&self, status: DeadLetterStatus, limit: i64) -> Result<Vec<StoredDeadLetter>> {
        self.ensure_schema().await?;

        let sql = format!(
            "SELECT id, event_id, sink_name, event_type, payload, error_message, error_stack, \
             retry_count, failed_at, last_attempt_at, status \
             FROM {} WHERE status = $1 ORDER BY failed_at, id LIMIT $2",
            self.qualified_table()
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn update_status(&self, id: i64, status: DeadLetterStatus) -> Result<bool> {
        self.ensure_schema().await?;

        let sql = format!("UPDATE {} SET status = $1 WHERE id = $2", self.qualified_table());
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }
}

/// Schema and table names are interpolated into DDL, so only plain
/// identifiers are accepted.
fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(TwinCdcError::ConfigError(format!("Invalid dead-letter identifier: {:?}", name)))
    }
}

fn db_error(e: sqlx::Error) -> TwinCdcError {
    TwinCdcError::DatabaseError(e.to_string())
}

//! Replication session over a dedicated PostgreSQL connection

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection, Row};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};
use twincdc_core::{Result, TwinCdcError};

use crate::{CaptureSettings, Lsn};

const APPLICATION_NAME: &str = "twincdc";

/// State of the logical replication slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotState {
    pub plugin: Option<String>,
    pub active: bool,
    pub confirmed_flush_lsn: Option<Lsn>,
}

/// One raw message from a peeked batch.
#[derive(Debug, Clone)]
pub struct WalMessage {
    pub lsn: Lsn,
    pub data: Vec<u8>,
}

/// Owns the replication connection; every round trip is bounded by the
/// WAL receiver timeout. Dropping the session closes the connection.
pub struct ReplicationSession {
    conn: PgConnection,
    slot_name: String,
    publication_name: String,
    timeout: Duration,
}

impl ReplicationSession {
    #[instrument(skip(settings), fields(slot = %settings.slot_name))]
    pub async fn connect(settings: &CaptureSettings) -> Result<Self> {
        let options = PgConnectOptions::from_str(&settings.connection_url)
            .map_err(|e| TwinCdcError::DatabaseError(format!("Invalid connection URL: {}", e)))?
            .application_name(APPLICATION_NAME)
            .disable_statement_logging();

        let conn = tokio::time::timeout(settings.connect_timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| TwinCdcError::DatabaseError("Timed out connecting to PostgreSQL".to_string()))?
            .map_err(|e| TwinCdcError::DatabaseError(format!("Connection failed: {}", e)))?;

        info!("Replication connection established");
        Ok(Self {
            conn,
            slot_name: settings.slot_name.clone(),
            publication_name: settings.publication_name.clone(),
            timeout: settings.wal_receiver_timeout,
        })
    }

    async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(|e| TwinCdcError::ReplicationError(format!("{} failed: {}", what, e))),
            Err(_) => Err(TwinCdcError::ReplicationError(format!(
                "{} timed out after {:?}",
                what, timeout
            ))),
        }
    }

    /// Check that the publication and the slot exist and the slot uses pgoutput.
    pub async fn verify(&mut self) -> Result<SlotState> {
        let publication = Self::bounded(
            self.timeout,
            "publication lookup",
            sqlx::query("SELECT pubname FROM pg_publication WHERE pubname = $1")
                .bind(&self.publication_name)
                .fetch_optional(&mut self.conn),
        )
        .await?;
        if publication.is_none() {
            return Err(TwinCdcError::ConfigError(format!(
                "Publication '{}' does not exist",
                self.publication_name
            )));
        }

        let slot = self
            .slot_state()
            .await?
            .ok_or_else(|| TwinCdcError::ConfigError(format!("Replication slot '{}' does not exist", self.slot_name)))?;

        if slot.plugin.as_deref() != Some("pgoutput") {
            return Err(TwinCdcError::ConfigError(format!(
                "Replication slot '{}' uses plugin {:?}, expected pgoutput",
                self.slot_name, slot.plugin
            )));
        }

        info!(
            publication = %self.publication_name,
            slot = %self.slot_name,
            confirmed = ?slot.confirmed_flush_lsn.map(|l| l.to_string()),
            "Publication and slot verified"
        );
        Ok(slot)
    }

    pub async fn slot_state(&mut self) -> Result<Option<SlotState>> {
        let row = Self::bounded(
            self.timeout,
            "slot lookup",
            sqlx::query(
                "SELECT plugin::text AS plugin, active, confirmed_flush_lsn::text AS confirmed \
                 FROM pg_replication_slots WHERE slot_name = $1",
            )
            .bind(&self.slot_name)
            .fetch_optional(&mut self.conn),
        )
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let confirmed: Option<String> = row.try_get("confirmed").map_err(db_error)?;
        Ok(Some(SlotState {
            plugin: row.try_get("plugin").map_err(db_error)?,
            active: row.try_get("active").map_err(db_error)?,
            confirmed_flush_lsn: confirmed.map(|s| s.parse::<Lsn>()).transpose()?,
        }))
    }

    /// Read up to `max_changes` changes without consuming them.
    pub async fn peek(&mut self, max_changes: usize) -> Result<Vec<WalMessage>> {
        let rows = Self::bounded(
            self.timeout,
            "peek changes",
            sqlx::query(
                "SELECT lsn::text AS lsn, data FROM pg_logical_slot_peek_binary_changes(\
                 $1::name, NULL::pg_lsn, $2, 'proto_version', '1', 'publication_names', $3)",
            )
            .bind(&self.slot_name)
            .bind(max_changes.min(i32::MAX as usize) as i32)
            .bind(&self.publication_name)
            .fetch_all(&mut self.conn),
        )
        .await?;

        rows.into_iter()
            .map(|row| -> Result<WalMessage> {
                let lsn: String = row.try_get("lsn").map_err(db_error)?;
                Ok(WalMessage {
                    lsn: lsn.parse::<Lsn>()?,
                    data: row.try_get("data").map_err(db_error)?,
                })
            })
            .collect()
    }

    /// Confirm everything up to `lsn`; the slot position is the durable checkpoint.
    pub async fn advance(&mut self, lsn: Lsn) -> Result<Lsn> {
        let row = Self::bounded(
            self.timeout,
            "slot advance",
            sqlx::query("SELECT end_lsn::text AS end_lsn FROM pg_replication_slot_advance($1::name, $2::pg_lsn)")
                .bind(&self.slot_name)
                .bind(lsn.to_string())
                .fetch_one(&mut self.conn),
        )
        .await?;

        let end: String = row.try_get("end_lsn").map_err(db_error)?;
        let end: Lsn = end.parse()?;
        debug!(requested = %lsn, confirmed = %end, "Slot advanced");
        Ok(end)
    }

    /// Bytes of WAL written but not yet confirmed by the slot.
    pub async fn lag_bytes(&mut self) -> Result<Option<u64>> {
        let row = Self::bounded(
            self.timeout,
            "lag query",
            sqlx::query(
                "SELECT pg_wal_lsn_diff(pg_current_wal_lsn(), confirmed_flush_lsn)::bigint AS lag \
                 FROM pg_replication_slots WHERE slot_name = $1",
            )
            .bind(&self.slot_name)
            .fetch_optional(&mut self.conn),
        )
        .await?;

        match row {
            Some(row) => {
                let lag: Option<i64> = row.try_get("lag").map_err(db_error)?;
                Ok(lag.map(|l| l.max(0) as u64))
            }
            None => Ok(None),
        }
    }

    pub async fn close(self) {
        if let Err(e) = self.conn.close().await {
            debug!("Error closing replication connection: {}", e);
        }
    }
}

fn db_error(e: sqlx::Error) -> TwinCdcError {
    TwinCdcError::DatabaseError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use twincdc_shared::TwinCdcConfig;

    #[tokio::test]
    #[ignore] // Requires PostgreSQL with Apache AGE and a pgoutput slot
    async fn test_replication_session() {
        let config = TwinCdcConfig::default();
        let settings = CaptureSettings::from_config(&config.database, &config.replication);

        let mut session = ReplicationSession::connect(&settings).await.unwrap();
        let slot = session.verify().await.unwrap();
        assert_eq!(slot.plugin.as_deref(), Some("pgoutput"));

        for message in session.peek(10).await.unwrap() {
            assert!(crate::pgoutput::decode(&message.data).is_ok());
        }
        session.close().await;
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let mut settings = CaptureSettings::from_config(
            &TwinCdcConfig::default().database,
            &TwinCdcConfig::default().replication,
        );
        settings.connection_url = "not a url".to_string();
        assert!(matches!(
            ReplicationSession::connect(&settings).await,
            Err(TwinCdcError::DatabaseError(_))
        ));
    }
}

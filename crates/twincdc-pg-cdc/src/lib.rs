//! PostgreSQL/AGE change data capture for twincdc
//!
//! Reads committed graph changes from a pgoutput logical replication slot,
//! maps them to twin and relationship records and hands them to the event
//! queue. The slot position is confirmed only after a batch is enqueued, so
//! a restart re-reads whatever was not yet handed off.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use twincdc_core::{EventQueueSender, Result, TwinCdcError};
use twincdc_shared::{
    EventMetrics, ExponentialBackoff, ReplicationHealth, RetryConfig, RetryPolicy, ShutdownCoordinator,
};

pub mod config;
pub mod connection;
pub mod lsn;
pub mod mapping;
pub mod pgoutput;
pub mod telemetry;

pub use config::*;
pub use connection::*;
pub use lsn::Lsn;
pub use mapping::{ChangeDecoder, DecodeOutcome, DecodedBatch, GraphLayout, RelationKind};
pub use telemetry::{parse_notification, TelemetryListener};

/// Logical replication subscriber feeding the event queue.
pub struct ChangeCaptureSubscriber {
    settings: CaptureSettings,
    queue: EventQueueSender,
    health: Arc<ReplicationHealth>,
    decoder: ChangeDecoder,
}

impl ChangeCaptureSubscriber {
    pub fn new(settings: CaptureSettings, queue: EventQueueSender, health: Arc<ReplicationHealth>) -> Self {
        let decoder = ChangeDecoder::new(settings.layout.clone());
        Self {
            settings,
            queue,
            health,
            decoder,
        }
    }

    fn reconnect_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(RetryConfig {
            max_attempts: u32::MAX,
            initial_delay_ms: self.settings.reconnect_initial_delay.as_millis() as u64,
            max_delay_ms: self.settings.reconnect_max_delay.as_millis() as u64,
            multiplier: 2.0,
            jitter_ms: 250,
        })
    }

    /// Capture until shutdown. Connection and replication failures reconnect
    /// with backoff; a missing publication or slot is fatal.
    #[instrument(skip(self, shutdown), fields(slot = %self.settings.slot_name))]
    pub async fn run(mut self, shutdown: ShutdownCoordinator) -> Result<()> {
        info!(
            publication = %self.settings.publication_name,
            graph = %self.settings.layout.graph_name,
            "Starting change capture"
        );

        let backoff = self.reconnect_policy();
        let mut verified = !self.settings.verify_on_startup;
        let mut failures: u32 = 0;

        while !shutdown.is_shutting_down() {
            match self.capture_session(&shutdown, &mut verified, &mut failures).await {
                Ok(()) => break,
                Err(e @ TwinCdcError::ConfigError(_)) => {
                    self.health.set_connected(false);
                    error!(error = %e, "Replication setup is invalid");
                    return Err(e);
                }
                Err(TwinCdcError::QueueClosed) => {
                    self.health.set_connected(false);
                    info!("Event queue closed, stopping change capture");
                    return Ok(());
                }
                Err(e) => {
                    self.health.set_connected(false);
                    failures = failures.saturating_add(1);
                    let delay = backoff.delay(failures);
                    warn!(error = %e, attempt = failures, ?delay, "Replication failed, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for_shutdown() => break,
                    }
                }
            }
        }

        self.health.set_connected(false);
        info!("Change capture stopped");
        Ok(())
    }

    async fn capture_session(
        &mut self,
        shutdown: &ShutdownCoordinator,
        verified: &mut bool,
        failures: &mut u32,
    ) -> Result<()> {
        let mut session = ReplicationSession::connect(&self.settings).await?;
        if !*verified {
            session.verify().await?;
            *verified = true;
        }
        self.health.set_connected(true);
        *failures = 0;

        let result = self.poll_until_shutdown(&mut session, shutdown).await;
        session.close().await;
        result
    }

    async fn poll_until_shutdown(
        &mut self,
        session: &mut ReplicationSession,
        shutdown: &ShutdownCoordinator,
    ) -> Result<()> {
        // Shutdown is only observed between polls so an in-flight batch is
        // always enqueued and confirmed together.
        while !shutdown.is_shutting_down() {
            if self.poll_once(session).await? == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    _ = shutdown.wait_for_shutdown() => {}
                }
            }
        }
        Ok(())
    }

    /// Peek one batch, enqueue its complete transactions and confirm them.
    /// Returns the number of replication messages consumed.
    pub async fn poll_once(&mut self, session: &mut ReplicationSession) -> Result<usize> {
        let started = Instant::now();
        let messages = session.peek(self.settings.max_batch_size).await?;
        self.health.record_activity();
        if messages.is_empty() {
            return Ok(0);
        }

        let batch = self.decoder.decode_batch(messages.iter().map(|m| &m.data))?;
        let Some(confirm_lsn) = batch.confirm_lsn else {
            debug!(messages = messages.len(), "No complete transaction in batch");
            return Ok(0);
        };

        let records = self.queue.enqueue_batch(batch.records).await?;
        let confirmed = session.advance(confirm_lsn).await?;
        self.health.record_activity();
        EventMetrics::batch_confirmed(records, started.elapsed());

        debug!(
            records,
            transactions = batch.transactions,
            skipped = batch.skipped,
            lsn = %confirmed,
            "Batch confirmed"
        );

        match session.lag_bytes().await {
            Ok(Some(lag)) => EventMetrics::replication_lag(lag),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Could not read replication lag"),
        }

        Ok(messages.len())
    }
}

//! Telemetry ingestion through PostgreSQL LISTEN/NOTIFY
//!
//! Producers publish `{twinId, componentName?, modelId?, messageId?, telemetry}`
//! with `pg_notify(channel, payload)`; each notification becomes a telemetry
//! record on the event queue.

use serde_json::Value;
use sqlx::postgres::PgListener;
use tracing::{error, info, instrument, warn};
use twincdc_core::{EventData, EventQueueSender, Result, TwinCdcError};
use twincdc_shared::{EventMetrics, ShutdownCoordinator};

use crate::mapping::DecodeOutcome;
use crate::TelemetrySettings;

/// Validate a notification payload and turn it into a telemetry record.
pub fn parse_notification(payload: &str) -> DecodeOutcome {
    let envelope: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            return DecodeOutcome::Skip {
                reason: format!("telemetry payload is not JSON: {}", e),
            }
        }
    };

    let has_twin = envelope
        .get("twinId")
        .and_then(Value::as_str)
        .map(|id| !id.is_empty())
        .unwrap_or(false);
    if !has_twin {
        return DecodeOutcome::Skip {
            reason: "telemetry payload without twinId".to_string(),
        };
    }
    if envelope.get("telemetry").is_none() {
        return DecodeOutcome::Skip {
            reason: "telemetry payload without telemetry body".to_string(),
        };
    }

    DecodeOutcome::Event(EventData::telemetry(envelope))
}

pub struct TelemetryListener {
    settings: TelemetrySettings,
    queue: EventQueueSender,
}

impl TelemetryListener {
    pub fn new(settings: TelemetrySettings, queue: EventQueueSender) -> Self {
        Self { settings, queue }
    }

    async fn listen(&self) -> Result<PgListener> {
        let mut listener = PgListener::connect(&self.settings.connection_url)
            .await
            .map_err(|e| TwinCdcError::DatabaseError(format!("Telemetry listener connect failed: {}", e)))?;
        listener
            .listen(&self.settings.channel)
            .await
            .map_err(|e| TwinCdcError::DatabaseError(format!("LISTEN failed: {}", e)))?;
        Ok(listener)
    }

    /// Run until shutdown. Connection failures are retried.
    #[instrument(skip(self, shutdown), fields(channel = %self.settings.channel))]
    pub async fn run(self, shutdown: ShutdownCoordinator) -> Result<()> {
        info!("Starting telemetry listener");

        'connect: while !shutdown.is_shutting_down() {
            let mut listener = match self.listen().await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(error = %e, "Telemetry listener unavailable, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.reconnect_delay) => continue 'connect,
                        _ = shutdown.wait_for_shutdown() => break 'connect,
                    }
                }
            };

            loop {
                let notification = tokio::select! {
                    received = listener.recv() => received,
                    _ = shutdown.wait_for_shutdown() => break 'connect,
                };

                let notification = match notification {
                    Ok(notification) => notification,
                    Err(e) => {
                        error!(error = %e, "Telemetry listener connection lost");
                        continue 'connect;
                    }
                };

                match parse_notification(notification.payload()) {
                    DecodeOutcome::Event(data) => {
                        EventMetrics::telemetry_received(true);
                        self.queue.enqueue(data).await?;
                    }
                    DecodeOutcome::Skip { reason } => {
                        EventMetrics::telemetry_received(false);
                        warn!(%reason, "Skipping telemetry notification");
                    }
                    DecodeOutcome::Control => {}
                }
            }
        }

        info!("Telemetry listener stopped");
        Ok(())
    }
}

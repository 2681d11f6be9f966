//! Settings for the capture subscriber and telemetry listener

use std::time::Duration;
use twincdc_shared::{DatabaseConfig, ReplicationConfig, TelemetryConfig};

use crate::mapping::GraphLayout;

/// Everything the replication session needs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub connection_url: String,
    pub publication_name: String,
    pub slot_name: String,
    pub layout: GraphLayout,
    pub max_batch_size: usize,
    pub connect_timeout: Duration,
    pub wal_receiver_timeout: Duration,
    pub poll_interval: Duration,
    pub verify_on_startup: bool,
    /// Backoff between reconnect attempts
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl CaptureSettings {
    pub fn from_config(database: &DatabaseConfig, replication: &ReplicationConfig) -> Self {
        Self {
            connection_url: database.url.clone(),
            publication_name: replication.publication_name.clone(),
            slot_name: replication.slot_name.clone(),
            layout: GraphLayout::new(&replication.graph_name, &replication.twin_label),
            max_batch_size: replication.max_batch_size.max(1),
            connect_timeout: Duration::from_secs(database.connection_timeout),
            wal_receiver_timeout: Duration::from_secs(replication.wal_receiver_timeout_seconds.max(1)),
            poll_interval: Duration::from_millis(replication.poll_interval_ms),
            verify_on_startup: replication.verify_on_startup,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub connection_url: String,
    pub channel: String,
    pub reconnect_delay: Duration,
}

impl TelemetrySettings {
    pub fn from_config(database: &DatabaseConfig, telemetry: &TelemetryConfig) -> Self {
        Self {
            connection_url: database.url.clone(),
            channel: telemetry.channel.clone(),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

//! Delivery side of twincdc: resilient sink wrapper, dead-letter store and
//! the webhook, analytics ingestion and MQTT sinks.

pub mod auth;
pub mod dead_letter;
pub mod ingest;
pub mod kusto;
pub mod mqtt;
pub mod registry;
pub mod resilient;
pub mod webhook;

pub use auth::RequestAuthenticator;
pub use dead_letter::PostgresDeadLetterStore;
pub use ingest::{IngestionStatus, QueuedIngestClient};
pub use kusto::{default_table_mappings, ColumnMapping, KustoSink, TableMapping};
pub use mqtt::MqttSink;
pub use registry::*;
pub use resilient::ResilientSink;
pub use webhook::WebhookSink;

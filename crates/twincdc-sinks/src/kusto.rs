//! Analytics ingestion sink (Kusto-compatible)
//!
//! Data-history events are grouped by type, projected into table rows with
//! JSON-path column mappings and queued for ingestion as NDJSON. Health
//! follows the outcome of the most recently completed ingestion operations.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use twincdc_core::{CloudEvent, EventSink, Result, SinkEventType, TwinCdcError};
use twincdc_shared::{EventMetrics, KustoSinkConfig};

use crate::auth::RequestAuthenticator;
use crate::ingest::{IngestionStatus, QueuedIngestClient};

/// One destination column fed from a JSON path into the CloudEvent,
/// e.g. `$.data.timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMapping {
    pub column: String,
    pub path: String,
}

impl ColumnMapping {
    pub fn new(column: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            path: path.into(),
        }
    }

    /// Resolve the path; missing values become null.
    pub fn resolve(&self, document: &Value) -> Value {
        let trimmed = self.path.strip_prefix('$').unwrap_or(&self.path);
        let mut current = document;
        for segment in trimmed.split('.').filter(|s| !s.is_empty()) {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableMapping {
    pub table: String,
    pub columns: Vec<ColumnMapping>,
}

impl TableMapping {
    /// Project one event into a row object.
    pub fn row(&self, event: &CloudEvent) -> Result<Value> {
        let document = serde_json::to_value(event)?;
        let row: Map<String, Value> = self
            .columns
            .iter()
            .map(|c| (c.column.clone(), c.resolve(&document)))
            .collect();
        Ok(Value::Object(row))
    }

    /// Newline-delimited JSON body for a group of events.
    pub fn ndjson(&self, events: &[&CloudEvent]) -> Result<Bytes> {
        let mut body = Vec::new();
        for event in events {
            serde_json::to_writer(&mut body, &self.row(event)?)?;
            body.push(b'\n');
        }
        Ok(Bytes::from(body))
    }
}

/// Built-in tables for the data-history family.
pub fn default_table_mappings() -> HashMap<SinkEventType, TableMapping> {
    let columns = |pairs: &[(&str, &str)]| -> Vec<ColumnMapping> {
        pairs.iter().map(|(c, p)| ColumnMapping::new(*c, *p)).collect()
    };

    let mut mappings = HashMap::new();
    mappings.insert(
        SinkEventType::PropertyEvent,
        TableMapping {
            table: "AdtPropertyEvents".to_string(),
            columns: columns(&[
                ("TimeStamp", "$.data.timestamp"),
                ("SourceTimeStamp", "$.data.sourceTimestamp"),
                ("ServiceId", "$.data.serviceId"),
                ("Id", "$.data.id"),
                ("ModelId", "$.data.modelId"),
                ("Key", "$.data.key"),
                ("Value", "$.data.value"),
                ("RelationshipTarget", "$.data.relationshipTarget"),
                ("RelationshipId", "$.data.relationshipId"),
                ("Action", "$.data.action"),
            ]),
        },
    );
    mappings.insert(
        SinkEventType::TwinLifecycle,
        TableMapping {
            table: "AdtTwinLifeCycleEvents".to_string(),
            columns: columns(&[
                ("TwinId", "$.data.twinId"),
                ("Action", "$.data.action"),
                ("TimeStamp", "$.data.timestamp"),
                ("ServiceId", "$.data.serviceId"),
                ("ModelId", "$.data.modelId"),
            ]),
        },
    );
    mappings.insert(
        SinkEventType::RelationshipLifecycle,
        TableMapping {
            table: "AdtRelationshipLifeCycleEvents".to_string(),
            columns: columns(&[
                ("RelationshipId", "$.data.relationshipId"),
                ("Name", "$.data.name"),
                ("Action", "$.data.action"),
                ("TimeStamp", "$.data.timestamp"),
                ("ServiceId", "$.data.serviceId"),
                ("Source", "$.data.source"),
                ("Target", "$.data.target"),
            ]),
        },
    );
    mappings
}

pub struct KustoSink {
    name: String,
    database: String,
    /// Keyed by CloudEvent `type` string as delivered to this sink
    mappings: HashMap<String, TableMapping>,
    client: Arc<QueuedIngestClient>,
    healthy: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl KustoSink {
    /// `type_for` gives the CloudEvent type string this sink receives for a
    /// taxonomy entry, route overrides included.
    pub fn new(config: &KustoSinkConfig, type_for: impl Fn(SinkEventType) -> String) -> Result<Self> {
        let base = reqwest::Url::parse(&config.ingestion_uri)
            .map_err(|e| TwinCdcError::ConfigError(format!("Kusto sink '{}' has an invalid URI: {}", config.name, e)))?;

        let mut tables = default_table_mappings();
        for (kind, table) in &config.tables {
            let kind = SinkEventType::from_str(kind)?;
            match tables.get_mut(&kind) {
                Some(mapping) => mapping.table = table.clone(),
                None => {
                    return Err(TwinCdcError::ConfigError(format!(
                        "Kusto sink '{}' has no column mapping for {}",
                        config.name, kind
                    )))
                }
            }
        }
        let mappings = tables
            .into_iter()
            .map(|(kind, mapping)| (type_for(kind), mapping))
            .collect();

        let client = Arc::new(QueuedIngestClient::start(
            base,
            RequestAuthenticator::new(config.auth.clone()),
        )?);
        let healthy = Arc::new(AtomicBool::new(true));

        let poller = tokio::spawn(poll_ingestion_status(
            config.name.clone(),
            client.clone(),
            healthy.clone(),
            Duration::from_millis(config.status_poll_interval_ms.max(10)),
        ));

        info!(sink = %config.name, database = %config.database, "Kusto sink created");

        Ok(Self {
            name: config.name.clone(),
            database: config.database.clone(),
            mappings,
            client,
            healthy,
            poller: Mutex::new(Some(poller)),
        })
    }

    /// Group events by type in arrival order, dropping unmapped types.
    fn group<'a>(&self, events: &'a [CloudEvent]) -> Vec<(&TableMapping, Vec<&'a CloudEvent>)> {
        let mut groups: Vec<(&TableMapping, Vec<&'a CloudEvent>)> = Vec::new();
        for event in events {
            let Some(mapping) = self.mappings.get(&event.event_type) else {
                warn!(sink = %self.name, event_type = %event.event_type, "No table mapping, skipping event");
                continue;
            };
            match groups.iter_mut().find(|(m, _)| m.table == mapping.table) {
                Some((_, group)) => group.push(event),
                None => groups.push((mapping, vec![event])),
            }
        }
        groups
    }

    pub fn client(&self) -> &QueuedIngestClient {
        &self.client
    }
}

/// Apply finished ingestion outcomes to the health flag.
pub fn apply_ingestion_outcomes(sink: &str, client: &QueuedIngestClient, healthy: &AtomicBool) {
    let completed = client.take_completed();
    if completed.is_empty() {
        return;
    }

    let failed = completed
        .iter()
        .filter(|(_, status)| matches!(status, IngestionStatus::Failed { .. }))
        .count();
    let ok = failed == 0;
    if !ok {
        warn!(sink, failed, total = completed.len(), "Ingestion operations failed");
    }
    healthy.store(ok, Ordering::SeqCst);
    EventMetrics::sink_health(sink, ok);
}

async fn poll_ingestion_status(
    sink: String,
    client: Arc<QueuedIngestClient>,
    healthy: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        apply_ingestion_outcomes(&sink, &client, &healthy);
    }
}

#[async_trait]
impl EventSink for KustoSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, events), fields(sink = %self.name, count = events.len()))]
    async fn send(&self, events: &[CloudEvent]) -> Result<()> {
        for (mapping, group) in self.group(events) {
            let body = mapping.ndjson(&group)?;
            let operation_id = self.client.ingest(&self.database, &mapping.table, body).await?;
            debug!(table = %mapping.table, rows = group.len(), %operation_id, "Ingestion queued");
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.abort();
        }
        self.client.close().await;
        apply_ingestion_outcomes(&self.name, &self.client, &self.healthy);
        info!(sink = %self.name, "Kusto sink stopped");
        Ok(())
    }
}

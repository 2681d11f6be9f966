//! Core event types: raw change records, CloudEvents and dead-letter records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Result, TwinCdcError};

/// Kind of mutation captured from the graph store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    TwinCreate,
    TwinUpdate,
    TwinDelete,
    RelationshipCreate,
    RelationshipUpdate,
    RelationshipDelete,
    Telemetry,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TwinCreate => "TwinCreate",
            EventType::TwinUpdate => "TwinUpdate",
            EventType::TwinDelete => "TwinDelete",
            EventType::RelationshipCreate => "RelationshipCreate",
            EventType::RelationshipUpdate => "RelationshipUpdate",
            EventType::RelationshipDelete => "RelationshipDelete",
            EventType::Telemetry => "Telemetry",
        }
    }

    pub fn is_twin(&self) -> bool {
        matches!(
            self,
            EventType::TwinCreate | EventType::TwinUpdate | EventType::TwinDelete
        )
    }

    pub fn is_relationship(&self) -> bool {
        matches!(
            self,
            EventType::RelationshipCreate
                | EventType::RelationshipUpdate
                | EventType::RelationshipDelete
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw change record handed from capture to the consumer.
///
/// Create carries only `new_value`, delete only `old_value`, update both.
/// Telemetry carries the ingestion envelope in `new_value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventData {
    pub event_type: EventType,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl EventData {
    pub fn new(
        event_type: EventType,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            old_value,
            new_value,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn twin_create(new_value: serde_json::Value) -> Self {
        Self::new(EventType::TwinCreate, None, Some(new_value))
    }

    pub fn twin_update(old_value: serde_json::Value, new_value: serde_json::Value) -> Self {
        Self::new(EventType::TwinUpdate, Some(old_value), Some(new_value))
    }

    pub fn twin_delete(old_value: serde_json::Value) -> Self {
        Self::new(EventType::TwinDelete, Some(old_value), None)
    }

    pub fn relationship_create(new_value: serde_json::Value) -> Self {
        Self::new(EventType::RelationshipCreate, None, Some(new_value))
    }

    pub fn relationship_update(
        old_value: serde_json::Value,
        new_value: serde_json::Value,
    ) -> Self {
        Self::new(EventType::RelationshipUpdate, Some(old_value), Some(new_value))
    }

    pub fn relationship_delete(old_value: serde_json::Value) -> Self {
        Self::new(EventType::RelationshipDelete, Some(old_value), None)
    }

    pub fn telemetry(envelope: serde_json::Value) -> Self {
        Self::new(EventType::Telemetry, None, Some(envelope))
    }

    /// Snapshot that identifies the entity: the new value, or the old one for deletes.
    pub fn identity_snapshot(&self) -> Option<&serde_json::Value> {
        self.new_value.as_ref().or(self.old_value.as_ref())
    }
}

/// Canonical taxonomy used both to pick a generation strategy and for routing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SinkEventType {
    TwinCreate,
    TwinUpdate,
    TwinDelete,
    RelationshipCreate,
    RelationshipUpdate,
    RelationshipDelete,
    PropertyEvent,
    TwinLifecycle,
    RelationshipLifecycle,
    Telemetry,
}

impl SinkEventType {
    pub const ALL: [SinkEventType; 10] = [
        SinkEventType::TwinCreate,
        SinkEventType::TwinUpdate,
        SinkEventType::TwinDelete,
        SinkEventType::RelationshipCreate,
        SinkEventType::RelationshipUpdate,
        SinkEventType::RelationshipDelete,
        SinkEventType::PropertyEvent,
        SinkEventType::TwinLifecycle,
        SinkEventType::RelationshipLifecycle,
        SinkEventType::Telemetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SinkEventType::TwinCreate => "TwinCreate",
            SinkEventType::TwinUpdate => "TwinUpdate",
            SinkEventType::TwinDelete => "TwinDelete",
            SinkEventType::RelationshipCreate => "RelationshipCreate",
            SinkEventType::RelationshipUpdate => "RelationshipUpdate",
            SinkEventType::RelationshipDelete => "RelationshipDelete",
            SinkEventType::PropertyEvent => "PropertyEvent",
            SinkEventType::TwinLifecycle => "TwinLifecycle",
            SinkEventType::RelationshipLifecycle => "RelationshipLifecycle",
            SinkEventType::Telemetry => "Telemetry",
        }
    }

    /// Type string suffix used when no override is configured.
    pub fn default_type_suffix(&self) -> &'static str {
        match self {
            SinkEventType::TwinCreate => "Twin.Create",
            SinkEventType::TwinUpdate => "Twin.Update",
            SinkEventType::TwinDelete => "Twin.Delete",
            SinkEventType::RelationshipCreate => "Relationship.Create",
            SinkEventType::RelationshipUpdate => "Relationship.Update",
            SinkEventType::RelationshipDelete => "Relationship.Delete",
            SinkEventType::PropertyEvent => "Property.Event",
            SinkEventType::TwinLifecycle => "Twin.Lifecycle",
            SinkEventType::RelationshipLifecycle => "Relationship.Lifecycle",
            SinkEventType::Telemetry => "IoT.Telemetry",
        }
    }

    pub fn family(&self) -> EventFamily {
        match self {
            SinkEventType::TwinCreate
            | SinkEventType::TwinUpdate
            | SinkEventType::TwinDelete
            | SinkEventType::RelationshipCreate
            | SinkEventType::RelationshipUpdate
            | SinkEventType::RelationshipDelete => EventFamily::Notification,
            SinkEventType::PropertyEvent
            | SinkEventType::TwinLifecycle
            | SinkEventType::RelationshipLifecycle => EventFamily::DataHistory,
            SinkEventType::Telemetry => EventFamily::Telemetry,
        }
    }

    /// Notification type matching a raw change kind.
    pub fn notification_for(event_type: EventType) -> SinkEventType {
        match event_type {
            EventType::TwinCreate => SinkEventType::TwinCreate,
            EventType::TwinUpdate => SinkEventType::TwinUpdate,
            EventType::TwinDelete => SinkEventType::TwinDelete,
            EventType::RelationshipCreate => SinkEventType::RelationshipCreate,
            EventType::RelationshipUpdate => SinkEventType::RelationshipUpdate,
            EventType::RelationshipDelete => SinkEventType::RelationshipDelete,
            EventType::Telemetry => SinkEventType::Telemetry,
        }
    }
}

impl fmt::Display for SinkEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkEventType {
    type Err = TwinCdcError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        SinkEventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().to_ascii_lowercase() == normalized)
            .ok_or_else(|| TwinCdcError::ConfigError(format!("Unknown sink event type: {}", s)))
    }
}

/// Output families the factory can produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventFamily {
    Notification,
    DataHistory,
    Telemetry,
}

pub const CLOUD_EVENTS_SPEC_VERSION: &str = "1.0";
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Media type of a structured-mode CloudEvent body.
pub const CLOUDEVENTS_CONTENT_TYPE: &str = "application/cloudevents+json";

/// CloudEvents v1.0 structured-mode envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudEvent {
    pub id: String,

    pub specversion: String,

    pub source: String,

    #[serde(rename = "type")]
    pub event_type: String,

    pub subject: String,

    pub time: DateTime<Utc>,

    pub datacontenttype: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dataschema: Option<String>,

    pub data: serde_json::Value,
}

impl CloudEvent {
    /// Create an event with a fresh id.
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        subject: impl Into<String>,
        time: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            specversion: CLOUD_EVENTS_SPEC_VERSION.to_string(),
            source: source.into(),
            event_type: event_type.into(),
            subject: subject.into(),
            time,
            datacontenttype: JSON_CONTENT_TYPE.to_string(),
            dataschema: None,
            data,
        }
    }

    pub fn with_dataschema(mut self, schema: impl Into<String>) -> Self {
        self.dataschema = Some(schema.into());
        self
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }
}

/// A CloudEvent tagged with the taxonomy entry that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedEvent {
    pub kind: SinkEventType,
    pub event: CloudEvent,
}

impl GeneratedEvent {
    pub fn new(kind: SinkEventType, event: CloudEvent) -> Self {
        Self { kind, event }
    }
}

/// Lifecycle state of a dead-letter record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    Pending,
    Replayed,
    Discarded,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Replayed => "replayed",
            DeadLetterStatus::Discarded => "discarded",
        }
    }
}

impl FromStr for DeadLetterStatus {
    type Err = TwinCdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(DeadLetterStatus::Pending),
            "replayed" => Ok(DeadLetterStatus::Replayed),
            "discarded" => Ok(DeadLetterStatus::Discarded),
            other => Err(TwinCdcError::InternalError(format!(
                "Unknown dead letter status: {}",
                other
            ))),
        }
    }
}

/// An event that could not be delivered to a sink after all retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterRecord {
    pub event_id: String,
    pub sink_name: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub error_stack: Option<String>,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
}

impl DeadLetterRecord {
    pub fn new(
        event: &CloudEvent,
        sink_name: impl Into<String>,
        error_message: impl Into<String>,
        retry_count: u32,
        first_attempt_at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            event_id: event.id.clone(),
            sink_name: sink_name.into(),
            event_type: event.event_type.clone(),
            payload: serde_json::to_value(event)?,
            error_message: error_message.into(),
            error_stack: None,
            retry_count,
            failed_at: first_attempt_at,
            last_attempt_at: Utc::now(),
            status: DeadLetterStatus::Pending,
        })
    }

    pub fn with_error_stack(mut self, stack: impl Into<String>) -> Self {
        self.error_stack = Some(stack.into());
        self
    }
}

//! Event factory: turns one raw change record into CloudEvents.
//!
//! Three output families are produced from the same [`EventData`]:
//!
//! * **notification**: twin/relationship create, update and delete events. Creates and
//!   deletes carry the full snapshot, updates carry `{modelId, patch}`.
//! * **data history**: lifecycle summaries plus one property event per changed leaf.
//! * **telemetry**: the raw telemetry payload passed through.
//!
//! The factory performs no I/O. Event ids are fresh on every call; consumers that need
//! idempotency should key on entity id, property key and timestamp.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::patch::{self, PatchOpKind, PatchOperation};
use crate::{
    CloudEvent, EventData, EventFamily, EventType, GeneratedEvent, Result, SinkEventType,
    TwinCdcError,
};

pub const DEFAULT_TYPE_PREFIX: &str = "Konnektr.DigitalTwins";

const DT_ID: &str = "$dtId";
const ETAG: &str = "$etag";
const METADATA: &str = "$metadata";
const MODEL: &str = "$model";
const RELATIONSHIP_ID: &str = "$relationshipId";
const SOURCE_ID: &str = "$sourceId";
const TARGET_ID: &str = "$targetId";
const RELATIONSHIP_NAME: &str = "$relationshipName";
const LAST_UPDATE_TIME: &str = "lastUpdateTime";
const SOURCE_TIME: &str = "sourceTime";

/// Action recorded on data-history events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryAction {
    Create,
    Update,
    Delete,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Create => "Create",
            HistoryAction::Update => "Update",
            HistoryAction::Delete => "Delete",
        }
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity fields pulled out of a twin or relationship snapshot.
#[derive(Debug, Clone, PartialEq)]
enum Entity {
    Twin {
        id: String,
        model_id: Option<String>,
    },
    Relationship {
        id: String,
        source_id: String,
        target_id: Option<String>,
        name: Option<String>,
    },
}

impl Entity {
    fn subject(&self) -> String {
        match self {
            Entity::Twin { id, .. } => id.clone(),
            Entity::Relationship { id, source_id, .. } => {
                format!("{}/relationships/{}", source_id, id)
            }
        }
    }

    fn key(&self) -> (&str, &str) {
        match self {
            Entity::Twin { id, .. } => ("twin", id.as_str()),
            Entity::Relationship { id, .. } => ("relationship", id.as_str()),
        }
    }
}

/// Builds CloudEvents for every enabled output family.
#[derive(Debug, Clone)]
pub struct EventFactory {
    source: String,
    service_id: String,
    type_prefix: String,
    type_overrides: HashMap<SinkEventType, String>,
}

impl EventFactory {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let service_id = service_id_from_source(&source);
        Self {
            source,
            service_id,
            type_prefix: DEFAULT_TYPE_PREFIX.to_string(),
            type_overrides: HashMap::new(),
        }
    }

    pub fn with_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.type_prefix = prefix.into();
        self
    }

    pub fn with_type_override(mut self, kind: SinkEventType, event_type: impl Into<String>) -> Self {
        self.type_overrides.insert(kind, event_type.into());
        self
    }

    pub fn with_type_overrides(mut self, overrides: HashMap<SinkEventType, String>) -> Self {
        self.type_overrides.extend(overrides);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// CloudEvent `type` string for a taxonomy entry.
    pub fn type_string(&self, kind: SinkEventType) -> String {
        match self.type_overrides.get(&kind) {
            Some(custom) => custom.clone(),
            None if self.type_prefix.is_empty() => kind.default_type_suffix().to_string(),
            None => format!("{}.{}", self.type_prefix, kind.default_type_suffix()),
        }
    }

    /// Run every requested family over one change record, in family order.
    pub fn create_events(
        &self,
        data: &EventData,
        families: &HashSet<EventFamily>,
    ) -> Result<Vec<GeneratedEvent>> {
        if data.event_type == EventType::Telemetry {
            if families.contains(&EventFamily::Telemetry) {
                return self.telemetry_events(data);
            }
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        if families.contains(&EventFamily::Notification) {
            events.extend(self.notification_events(data)?);
        }
        if families.contains(&EventFamily::DataHistory) {
            events.extend(self.data_history_events(data)?);
        }
        Ok(events)
    }

    /// Notification family for a twin or relationship change.
    pub fn notification_events(&self, data: &EventData) -> Result<Vec<GeneratedEvent>> {
        let kind = SinkEventType::notification_for(data.event_type);

        let (entity, payload) = match data.event_type {
            EventType::TwinCreate | EventType::RelationshipCreate => {
                let new = require(data.new_value.as_ref(), data.event_type, "new value")?;
                (self.entity(data.event_type, new)?, new.clone())
            }
            EventType::TwinDelete | EventType::RelationshipDelete => {
                let old = require(data.old_value.as_ref(), data.event_type, "old value")?;
                (self.entity(data.event_type, old)?, old.clone())
            }
            EventType::TwinUpdate | EventType::RelationshipUpdate => {
                let (old, new, entity) = self.update_pair(data)?;
                let patch = notification_patch(old, new);
                let payload = json!({
                    "modelId": model_id(new),
                    "patch": patch,
                });
                (entity, payload)
            }
            EventType::Telemetry => {
                return Err(TwinCdcError::invalid_change(
                    "telemetry records have no notification events",
                ))
            }
        };

        let event = CloudEvent::new(
            self.source.clone(),
            self.type_string(kind),
            entity.subject(),
            data.timestamp,
            payload,
        );
        Ok(vec![GeneratedEvent::new(kind, event)])
    }

    /// Data-history family: lifecycle summaries and per-property events.
    pub fn data_history_events(&self, data: &EventData) -> Result<Vec<GeneratedEvent>> {
        let empty = Value::Object(Map::new());

        let mut events = Vec::new();
        match data.event_type {
            EventType::TwinCreate | EventType::RelationshipCreate => {
                let new = require(data.new_value.as_ref(), data.event_type, "new value")?;
                let entity = self.entity(data.event_type, new)?;
                events.push(self.lifecycle_event(&entity, HistoryAction::Create, data.timestamp));
                events.extend(self.property_events(&entity, &empty, new, data.timestamp));
            }
            EventType::TwinDelete | EventType::RelationshipDelete => {
                let old = require(data.old_value.as_ref(), data.event_type, "old value")?;
                let entity = self.entity(data.event_type, old)?;
                events.push(self.lifecycle_event(&entity, HistoryAction::Delete, data.timestamp));
                events.extend(self.property_events(&entity, old, &empty, data.timestamp));
            }
            EventType::TwinUpdate | EventType::RelationshipUpdate => {
                let (old, new, entity) = self.update_pair(data)?;
                events.extend(self.property_events(&entity, old, new, data.timestamp));

                if let Entity::Twin { .. } = entity {
                    if model_id(old) != model_id(new) {
                        events.push(self.lifecycle_event(
                            &entity,
                            HistoryAction::Update,
                            data.timestamp,
                        ));
                    }
                }
            }
            EventType::Telemetry => {
                return Err(TwinCdcError::invalid_change(
                    "telemetry records have no data history events",
                ))
            }
        }
        Ok(events)
    }

    /// Telemetry passthrough. The record carries the ingestion envelope
    /// `{twinId, componentName?, modelId?, telemetry}`.
    pub fn telemetry_events(&self, data: &EventData) -> Result<Vec<GeneratedEvent>> {
        if data.event_type != EventType::Telemetry {
            return Err(TwinCdcError::invalid_change(format!(
                "{} is not a telemetry record",
                data.event_type
            )));
        }

        let envelope = require(data.new_value.as_ref(), data.event_type, "telemetry envelope")?;
        let twin_id = string_field(envelope, "twinId")
            .ok_or_else(|| TwinCdcError::invalid_change("telemetry without twinId"))?;
        let payload = envelope
            .get("telemetry")
            .cloned()
            .ok_or_else(|| TwinCdcError::invalid_change("telemetry envelope without payload"))?;

        let subject = match string_field(envelope, "componentName") {
            Some(component) => format!("{}/components/{}", twin_id, component),
            None => twin_id,
        };

        let mut event = CloudEvent::new(
            self.source.clone(),
            self.type_string(SinkEventType::Telemetry),
            subject,
            data.timestamp,
            payload,
        );
        if let Some(model) = string_field(envelope, "modelId") {
            event = event.with_dataschema(model);
        }

        Ok(vec![GeneratedEvent::new(SinkEventType::Telemetry, event)])
    }

    fn update_pair<'a>(&self, data: &'a EventData) -> Result<(&'a Value, &'a Value, Entity)> {
        let old = require(data.old_value.as_ref(), data.event_type, "old value")?;
        let new = require(data.new_value.as_ref(), data.event_type, "new value")?;
        let old_entity = self.entity(data.event_type, old)?;
        let new_entity = self.entity(data.event_type, new)?;

        if old_entity.key() != new_entity.key() {
            return Err(TwinCdcError::invalid_change(format!(
                "{} changes entity identity from {} to {}",
                data.event_type,
                old_entity.subject(),
                new_entity.subject()
            )));
        }
        Ok((old, new, new_entity))
    }

    fn entity(&self, event_type: EventType, snapshot: &Value) -> Result<Entity> {
        if !snapshot.is_object() {
            return Err(TwinCdcError::invalid_change(format!(
                "{} snapshot is not a JSON object",
                event_type
            )));
        }

        if event_type.is_twin() {
            let id = string_field(snapshot, DT_ID)
                .ok_or_else(|| TwinCdcError::invalid_change(format!("{} without {}", event_type, DT_ID)))?;
            return Ok(Entity::Twin {
                id,
                model_id: model_id(snapshot),
            });
        }

        if event_type.is_relationship() {
            let id = string_field(snapshot, RELATIONSHIP_ID).ok_or_else(|| {
                TwinCdcError::invalid_change(format!("{} without {}", event_type, RELATIONSHIP_ID))
            })?;
            let source_id = string_field(snapshot, SOURCE_ID).ok_or_else(|| {
                TwinCdcError::invalid_change(format!("{} without {}", event_type, SOURCE_ID))
            })?;
            return Ok(Entity::Relationship {
                id,
                source_id,
                target_id: string_field(snapshot, TARGET_ID),
                name: string_field(snapshot, RELATIONSHIP_NAME),
            });
        }

        Err(TwinCdcError::invalid_change(format!(
            "{} does not describe a twin or relationship",
            event_type
        )))
    }

    fn lifecycle_event(
        &self,
        entity: &Entity,
        action: HistoryAction,
        timestamp: DateTime<Utc>,
    ) -> GeneratedEvent {
        let (kind, payload) = match entity {
            Entity::Twin { id, model_id } => (
                SinkEventType::TwinLifecycle,
                json!({
                    "twinId": id,
                    "action": action.as_str(),
                    "timestamp": format_time(timestamp),
                    "serviceId": self.service_id,
                    "modelId": model_id,
                }),
            ),
            Entity::Relationship {
                id,
                source_id,
                target_id,
                name,
            } => (
                SinkEventType::RelationshipLifecycle,
                json!({
                    "relationshipId": id,
                    "name": name,
                    "action": action.as_str(),
                    "timestamp": format_time(timestamp),
                    "serviceId": self.service_id,
                    "source": source_id,
                    "target": target_id,
                }),
            ),
        };

        let event = CloudEvent::new(
            self.source.clone(),
            self.type_string(kind),
            entity.subject(),
            timestamp,
            payload,
        );
        GeneratedEvent::new(kind, event)
    }

    fn property_events(
        &self,
        entity: &Entity,
        old: &Value,
        new: &Value,
        timestamp: DateTime<Utc>,
    ) -> Vec<GeneratedEvent> {
        let subject = entity.subject();
        let event_type = self.type_string(SinkEventType::PropertyEvent);

        property_changes(old, new)
            .into_iter()
            .map(|change| {
                let mut payload = Map::new();
                payload.insert("timestamp".into(), json!(format_time(timestamp)));
                payload.insert("serviceId".into(), json!(self.service_id));

                match entity {
                    Entity::Twin { id, model_id } => {
                        payload.insert("id".into(), json!(id));
                        payload.insert("modelId".into(), json!(model_id));
                    }
                    Entity::Relationship {
                        id,
                        source_id,
                        target_id,
                        ..
                    } => {
                        payload.insert("id".into(), json!(source_id));
                        payload.insert("modelId".into(), Value::Null);
                        payload.insert("relationshipTarget".into(), json!(target_id));
                        payload.insert("relationshipId".into(), json!(id));
                    }
                }

                payload.insert("key".into(), json!(change.key));
                payload.insert("value".into(), change.value);
                payload.insert("action".into(), json!(change.action.as_str()));
                if let Some(source_time) = change.source_timestamp {
                    payload.insert("sourceTimestamp".into(), source_time);
                }

                let event = CloudEvent::new(
                    self.source.clone(),
                    event_type.clone(),
                    subject.clone(),
                    timestamp,
                    Value::Object(payload),
                );
                GeneratedEvent::new(SinkEventType::PropertyEvent, event)
            })
            .collect()
    }
}

/// One changed leaf property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub key: String,
    pub value: Value,
    pub action: HistoryAction,
    pub source_timestamp: Option<Value>,
}

/// Patch for update notifications: the structural diff without system fields,
/// plus replace operations for properties refreshed with an identical value.
pub fn notification_patch(old: &Value, new: &Value) -> Vec<PatchOperation> {
    let mut ops: Vec<PatchOperation> = patch::diff(old, new)
        .into_iter()
        .filter(|op| !is_system_path(op))
        .collect();
    let refreshed = refresh_operations(old, new, &ops);
    ops.extend(refreshed);
    ops
}

/// Changed leaf properties between two snapshots, `$`-prefixed keys excluded.
pub fn property_changes(old: &Value, new: &Value) -> Vec<PropertyChange> {
    let mut ops: Vec<PatchOperation> = patch::diff(old, new)
        .into_iter()
        .filter(|op| !op.segments().iter().any(|s| s.starts_with('$')))
        .collect();
    let refreshed = refresh_operations(old, new, &ops);
    ops.extend(refreshed);

    let mut changes = Vec::new();
    for op in &ops {
        let segments = op.segments();
        if segments.is_empty() {
            continue;
        }

        let mut leaves = Vec::new();
        match op.op {
            PatchOpKind::Remove => {
                let removed = old.pointer(&op.path).cloned().unwrap_or(Value::Null);
                collect_leaves(&mut segments.clone(), &removed, &mut leaves);
                for (leaf, _) in leaves {
                    changes.push(PropertyChange {
                        key: leaf.join("."),
                        value: Value::Null,
                        action: HistoryAction::Delete,
                        source_timestamp: None,
                    });
                }
            }
            PatchOpKind::Add | PatchOpKind::Replace => {
                // A replace can swap an object for a scalar or the reverse, so
                // leaves are matched against the ones that existed before.
                let mut previous = Vec::new();
                if op.op == PatchOpKind::Replace {
                    if let Some(replaced) = old.pointer(&op.path) {
                        collect_leaves(&mut segments.clone(), replaced, &mut previous);
                    }
                }

                let value = op.value.clone().unwrap_or(Value::Null);
                collect_leaves(&mut segments.clone(), &value, &mut leaves);

                for (leaf, _) in previous.iter().filter(|(p, _)| !leaves.iter().any(|(l, _)| l == p)) {
                    changes.push(PropertyChange {
                        key: leaf.join("."),
                        value: Value::Null,
                        action: HistoryAction::Delete,
                        source_timestamp: None,
                    });
                }
                for (leaf, leaf_value) in leaves {
                    let action = if previous.iter().any(|(p, _)| *p == leaf) {
                        HistoryAction::Update
                    } else {
                        HistoryAction::Create
                    };
                    let source_timestamp = changed_source_time(old, new, &leaf);
                    changes.push(PropertyChange {
                        key: leaf.join("."),
                        value: leaf_value,
                        action,
                        source_timestamp,
                    });
                }
            }
        }
    }
    changes
}

fn is_system_path(op: &PatchOperation) -> bool {
    matches!(
        op.segments().first().map(String::as_str),
        Some(ETAG) | Some(DT_ID)
    )
}

fn refresh_operations(old: &Value, new: &Value, existing: &[PatchOperation]) -> Vec<PatchOperation> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    collect_refreshes(&mut path, old, new, existing, &mut out);
    out
}

/// Walk every object level present in both snapshots and emit a replace for
/// each property whose `lastUpdateTime` moved while no operation covers it.
fn collect_refreshes(
    path: &mut Vec<String>,
    old: &Value,
    new: &Value,
    existing: &[PatchOperation],
    out: &mut Vec<PatchOperation>,
) {
    let (Some(old_obj), Some(new_obj)) = (old.as_object(), new.as_object()) else {
        return;
    };

    if let Some(new_meta) = new_obj.get(METADATA).and_then(Value::as_object) {
        let old_meta = old_obj.get(METADATA).and_then(Value::as_object);

        for (prop, meta) in new_meta.iter().filter(|(k, _)| !k.starts_with('$')) {
            let Some(value) = new_obj.get(prop) else {
                continue;
            };
            let new_time = meta.get(LAST_UPDATE_TIME);
            let old_time = old_meta
                .and_then(|m| m.get(prop))
                .and_then(|m| m.get(LAST_UPDATE_TIME));
            if new_time.is_none() || new_time == old_time {
                continue;
            }

            path.push(prop.clone());
            let pointer = patch::to_pointer(path);
            path.pop();

            let covered = existing
                .iter()
                .chain(out.iter())
                .any(|op| op.touches(&pointer));
            if !covered {
                out.push(PatchOperation::replace(pointer, value.clone()));
            }
        }
    }

    for (key, new_child) in new_obj.iter().filter(|(k, _)| !k.starts_with('$')) {
        if let Some(old_child) = old_obj.get(key) {
            if old_child.is_object() && new_child.is_object() {
                path.push(key.clone());
                collect_refreshes(path, old_child, new_child, existing, out);
                path.pop();
            }
        }
    }
}

/// Expand `value` at `path` into leaf properties, skipping `$` keys. A
/// literally empty object counts as a leaf.
fn collect_leaves(path: &mut Vec<String>, value: &Value, out: &mut Vec<(Vec<String>, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map.iter().filter(|(k, _)| !k.starts_with('$')) {
                path.push(key.clone());
                collect_leaves(path, child, out);
                path.pop();
            }
        }
        _ => out.push((path.clone(), value.clone())),
    }
}

/// `sourceTime` of a leaf, if it differs from the previous snapshot. Property
/// metadata lives next to the property under its owner's `$metadata`.
fn changed_source_time(old: &Value, new: &Value, leaf: &[String]) -> Option<Value> {
    let (prop, owner) = leaf.split_last()?;
    let mut meta_path: Vec<String> = owner.to_vec();
    meta_path.push(METADATA.to_string());
    meta_path.push(prop.clone());
    meta_path.push(SOURCE_TIME.to_string());
    let pointer = patch::to_pointer(&meta_path);

    let new_time = new.pointer(&pointer)?;
    if new_time.is_null() || old.pointer(&pointer) == Some(new_time) {
        return None;
    }
    Some(new_time.clone())
}

fn require<'a>(value: Option<&'a Value>, event_type: EventType, what: &str) -> Result<&'a Value> {
    value.ok_or_else(|| TwinCdcError::invalid_change(format!("{} without {}", event_type, what)))
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn model_id(snapshot: &Value) -> Option<String> {
    snapshot
        .get(METADATA)
        .and_then(|m| m.get(MODEL))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn format_time(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Host part of the source URI, or the whole string when it has no scheme.
fn service_id_from_source(source: &str) -> String {
    let Some((_, rest)) = source.split_once("://") else {
        return source.to_string();
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    let host = authority.rsplit('@').next().unwrap_or(authority);
    host.split(':').next().unwrap_or(host).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn factory() -> EventFactory {
        EventFactory::new("https://graph.example.com")
    }

    fn all_families() -> HashSet<EventFamily> {
        [EventFamily::Notification, EventFamily::DataHistory, EventFamily::Telemetry]
            .into_iter()
            .collect()
    }

    fn room(temperature: i64, updated: &str) -> Value {
        json!({
            "$dtId": "room-1",
            "$etag": format!("W/\"{}\"", updated),
            "$metadata": {
                "$model": "dtmi:x:Room;1",
                "$lastUpdateTime": updated,
                "temperature": {"lastUpdateTime": updated}
            },
            "temperature": temperature
        })
    }

    #[test]
    fn test_service_id_from_source() {
        assert_eq!(service_id_from_source("https://graph.example.com/x"), "graph.example.com");
        assert_eq!(service_id_from_source("http://user@host:8080"), "host");
        assert_eq!(service_id_from_source("plain"), "plain");
    }

    #[test]
    fn test_type_strings() {
        let factory = factory().with_type_override(SinkEventType::Telemetry, "custom.telemetry");
        assert_eq!(
            factory.type_string(SinkEventType::TwinUpdate),
            "Konnektr.DigitalTwins.Twin.Update"
        );
        assert_eq!(factory.type_string(SinkEventType::Telemetry), "custom.telemetry");
        assert_eq!(
            EventFactory::new("s").with_type_prefix("").type_string(SinkEventType::PropertyEvent),
            "Property.Event"
        );
    }

    #[test]
    fn test_twin_create_data_history() {
        let data = EventData::twin_create(json!({
            "$dtId": "room-1",
            "$metadata": {"$model": "dtmi:x:Room;1"},
            "temperature": 20
        }));

        let events = factory().data_history_events(&data).unwrap();
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].kind, SinkEventType::TwinLifecycle);
        assert_eq!(events[0].event.data["action"], "Create");
        assert_eq!(events[0].event.data["twinId"], "room-1");
        assert_eq!(events[0].event.data["modelId"], "dtmi:x:Room;1");
        assert_eq!(events[0].event.data["serviceId"], "graph.example.com");

        assert_eq!(events[1].kind, SinkEventType::PropertyEvent);
        assert_eq!(events[1].event.event_type, "Konnektr.DigitalTwins.Property.Event");
        assert_eq!(events[1].event.data["action"], "Create");
        assert_eq!(events[1].event.data["key"], "temperature");
        assert_eq!(events[1].event.data["value"], 20);
        assert_eq!(events[1].event.subject, "room-1");
    }

    #[test]
    fn test_relationship_delete_notification() {
        let old = json!({
            "$relationshipId": "r1",
            "$sourceId": "a",
            "$targetId": "b",
            "$relationshipName": "contains"
        });
        let data = EventData::relationship_delete(old.clone());

        let events = factory().notification_events(&data).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SinkEventType::RelationshipDelete);
        assert_eq!(events[0].event.event_type, "Konnektr.DigitalTwins.Relationship.Delete");
        assert_eq!(events[0].event.subject, "a/relationships/r1");
        assert_eq!(events[0].event.data, old);
    }

    #[test]
    fn test_update_patch_reproduces_new_value() {
        let old = json!({
            "$dtId": "room-1",
            "$etag": "W/\"1\"",
            "$metadata": {"$model": "dtmi:x:Room;1", "temperature": {"lastUpdateTime": "t1"}},
            "temperature": 20,
            "name": "Lobby",
            "thermostat": {"$metadata": {}, "setpoint": 21}
        });
        let new = json!({
            "$dtId": "room-1",
            "$etag": "W/\"2\"",
            "$metadata": {"$model": "dtmi:x:Room;1", "temperature": {"lastUpdateTime": "t2"}, "humidity": {"lastUpdateTime": "t2"}},
            "temperature": 22,
            "humidity": 40,
            "thermostat": {"$metadata": {}, "setpoint": 19}
        });

        let events = factory()
            .notification_events(&EventData::twin_update(old.clone(), new.clone()))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SinkEventType::TwinUpdate);
        assert_eq!(events[0].event.data["modelId"], "dtmi:x:Room;1");

        let ops: Vec<PatchOperation> =
            serde_json::from_value(events[0].event.data["patch"].clone()).unwrap();
        assert!(ops.iter().all(|op| !op.path.starts_with("/$etag")));

        let mut patched = old.clone();
        patch::apply(&mut patched, &ops).unwrap();
        patched["$etag"] = new["$etag"].clone();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_same_value_refresh() {
        let old = room(20, "2024-01-01T00:00:00Z");
        let new = room(20, "2024-01-01T00:05:00Z");
        let data = EventData::twin_update(old, new);

        let notification = factory().notification_events(&data).unwrap();
        let patch = notification[0].event.data["patch"].as_array().unwrap();
        assert!(patch
            .iter()
            .any(|op| op["op"] == "replace" && op["path"] == "/temperature" && op["value"] == 20));

        let history = factory().data_history_events(&data).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event.data["key"], "temperature");
        assert_eq!(history[0].event.data["value"], 20);
        assert_eq!(history[0].event.data["action"], "Update");
    }

    #[test]
    fn test_refresh_not_duplicated_when_value_changed() {
        let old = room(20, "t1");
        let new = room(25, "t2");
        let ops = notification_patch(&old, &new);
        let temperature_ops = ops.iter().filter(|op| op.path == "/temperature").count();
        assert_eq!(temperature_ops, 1);
    }

    #[test]
    fn test_property_events_match_changed_leaves() {
        let old = json!({
            "$dtId": "room-1",
            "$metadata": {"$model": "dtmi:x:Room;1"},
            "a": 1,
            "b": 2,
            "gone": "x",
            "comp": {"$metadata": {}, "inner": 1, "same": true}
        });
        let new = json!({
            "$dtId": "room-1",
            "$metadata": {"$model": "dtmi:x:Room;1"},
            "a": 1,
            "b": 3,
            "added": {"deep": 5},
            "comp": {"$metadata": {}, "inner": 2, "same": true}
        });

        let events = factory()
            .data_history_events(&EventData::twin_update(old, new))
            .unwrap();
        let pairs: HashSet<(String, String)> = events
            .iter()
            .map(|e| {
                (
                    e.event.data["key"].as_str().unwrap().to_string(),
                    e.event.data["value"].to_string(),
                )
            })
            .collect();

        let expected: HashSet<(String, String)> = [
            ("gone", "null"),
            ("b", "3"),
            ("comp.inner", "2"),
            ("added.deep", "5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(pairs, expected);

        let gone = events.iter().find(|e| e.event.data["key"] == "gone").unwrap();
        assert_eq!(gone.event.data["action"], "Delete");
        let added = events.iter().find(|e| e.event.data["key"] == "added.deep").unwrap();
        assert_eq!(added.event.data["action"], "Create");
    }

    #[test]
    fn test_model_change_adds_lifecycle_update() {
        let old = json!({"$dtId": "t", "$metadata": {"$model": "dtmi:x:A;1"}, "p": 1});
        let new = json!({"$dtId": "t", "$metadata": {"$model": "dtmi:x:A;2"}, "p": 1});

        let events = factory()
            .data_history_events(&EventData::twin_update(old, new))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SinkEventType::TwinLifecycle);
        assert_eq!(events[0].event.data["action"], "Update");
        assert_eq!(events[0].event.data["modelId"], "dtmi:x:A;2");
    }

    #[test]
    fn test_source_timestamp_included_when_changed() {
        let old = json!({
            "$dtId": "t",
            "$metadata": {"p": {"lastUpdateTime": "t1", "sourceTime": "s1"}},
            "p": 1
        });
        let new = json!({
            "$dtId": "t",
            "$metadata": {"p": {"lastUpdateTime": "t2", "sourceTime": "s2"}},
            "p": 2
        });

        let changes = property_changes(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].source_timestamp, Some(json!("s2")));
    }

    fn summarize(changes: &[PropertyChange]) -> Vec<(String, Value, HistoryAction)> {
        changes
            .iter()
            .map(|c| (c.key.clone(), c.value.clone(), c.action))
            .collect()
    }

    #[test]
    fn test_object_replaced_by_scalar() {
        let old = json!({"$dtId": "t", "comp": {"a": 1, "b": 2}});
        let new = json!({"$dtId": "t", "comp": 5});

        assert_eq!(
            summarize(&property_changes(&old, &new)),
            vec![
                ("comp.a".to_string(), Value::Null, HistoryAction::Delete),
                ("comp.b".to_string(), Value::Null, HistoryAction::Delete),
                ("comp".to_string(), json!(5), HistoryAction::Create),
            ]
        );
    }

    #[test]
    fn test_scalar_replaced_by_object() {
        let old = json!({"$dtId": "t", "comp": 5});
        let new = json!({"$dtId": "t", "comp": {"a": 1}});

        assert_eq!(
            summarize(&property_changes(&old, &new)),
            vec![
                ("comp".to_string(), Value::Null, HistoryAction::Delete),
                ("comp.a".to_string(), json!(1), HistoryAction::Create),
            ]
        );

        let scalar = json!({"$dtId": "t", "comp": 6});
        let changes = property_changes(&old, &scalar);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, HistoryAction::Update);
    }

    #[test]
    fn test_relationship_property_events() {
        let old = json!({"$relationshipId": "r1", "$sourceId": "a", "$targetId": "b", "weight": 1});
        let new = json!({"$relationshipId": "r1", "$sourceId": "a", "$targetId": "b", "weight": 2});

        let events = factory()
            .data_history_events(&EventData::relationship_update(old, new))
            .unwrap();
        assert_eq!(events.len(), 1);
        let data = &events[0].event.data;
        assert_eq!(data["id"], "a");
        assert_eq!(data["relationshipId"], "r1");
        assert_eq!(data["relationshipTarget"], "b");
        assert_eq!(events[0].event.subject, "a/relationships/r1");
    }

    #[test]
    fn test_relationship_create_lifecycle() {
        let data = EventData::relationship_create(json!({
            "$relationshipId": "r1",
            "$sourceId": "a",
            "$targetId": "b",
            "$relationshipName": "contains",
            "weight": 1
        }));

        let events = factory().data_history_events(&data).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, SinkEventType::RelationshipLifecycle);
        let lifecycle = &events[0].event.data;
        assert_eq!(lifecycle["action"], "Create");
        assert_eq!(lifecycle["name"], "contains");
        assert_eq!(lifecycle["source"], "a");
        assert_eq!(lifecycle["target"], "b");
        assert_eq!(events[1].event.data["key"], "weight");
    }

    #[test]
    fn test_delete_clears_every_property() {
        let old = json!({"$dtId": "t", "$metadata": {"$model": "m"}, "x": 1, "y": {"z": 2}});
        let events = factory()
            .data_history_events(&EventData::twin_delete(old))
            .unwrap();

        assert_eq!(events[0].kind, SinkEventType::TwinLifecycle);
        assert_eq!(events[0].event.data["action"], "Delete");
        let keys: Vec<_> = events[1..]
            .iter()
            .map(|e| e.event.data["key"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["x", "y.z"]);
        assert!(events[1..].iter().all(|e| e.event.data["value"].is_null()));
    }

    #[test]
    fn test_repeated_calls_differ_only_in_id() {
        let data = EventData::twin_create(json!({"$dtId": "room-1", "temperature": 20}));
        let factory = factory();

        let first = factory.create_events(&data, &all_families()).unwrap();
        let second = factory.create_events(&data, &all_families()).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.event.data, b.event.data);
            assert_eq!(a.event.subject, b.event.subject);
            assert_ne!(a.event.id, b.event.id);
        }
    }

    #[test]
    fn test_telemetry_passthrough() {
        let data = EventData::telemetry(json!({
            "twinId": "room-1",
            "componentName": "thermostat",
            "modelId": "dtmi:x:Thermostat;1",
            "telemetry": {"temperature": 21.5}
        }));

        let events = factory().create_events(&data, &all_families()).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0].event;
        assert_eq!(event.subject, "room-1/components/thermostat");
        assert_eq!(event.dataschema.as_deref(), Some("dtmi:x:Thermostat;1"));
        assert_eq!(event.data, json!({"temperature": 21.5}));
        assert_eq!(event.event_type, "Konnektr.DigitalTwins.IoT.Telemetry");
    }

    #[test]
    fn test_missing_identity_is_rejected() {
        let data = EventData::twin_create(json!({"temperature": 20}));
        assert!(matches!(
            factory().notification_events(&data),
            Err(TwinCdcError::InvalidChange(_))
        ));

        let mismatched = EventData::twin_update(json!({"$dtId": "a"}), json!({"$dtId": "b"}));
        assert!(factory().notification_events(&mismatched).is_err());
    }

    #[test]
    fn test_disabled_families_produce_nothing() {
        let data = EventData::twin_create(json!({"$dtId": "room-1", "temperature": 20}));
        let only_notifications: HashSet<_> = [EventFamily::Notification].into_iter().collect();

        let events = factory().create_events(&data, &only_notifications).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SinkEventType::TwinCreate);
    }
}

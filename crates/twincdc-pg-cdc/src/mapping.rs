//! Maps decoded row changes on graph tables to EventData records
//!
//! Twins live in the vertex table named after the twin label; any table in
//! the graph schema with `start_id` and `end_id` columns holds relationship
//! edges. The JSON snapshot of a row is its `properties` column.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};
use twincdc_core::{EventData, EventType, Result};
use twincdc_shared::EventMetrics;

use crate::pgoutput::{self, OldImage, PgOutputMessage, RelationInfo, TupleData, TupleValue};
use crate::Lsn;

pub const PROPERTIES_COLUMN: &str = "properties";

/// What a relation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Twin,
    Relationship,
    Ignored,
}

/// Result of interpreting one replication message.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Event(EventData),
    /// The change is not representable; carries the diagnostic.
    Skip { reason: String },
    /// Protocol bookkeeping with no event.
    Control,
}

impl DecodeOutcome {
    fn skip(reason: impl Into<String>) -> Self {
        DecodeOutcome::Skip {
            reason: reason.into(),
        }
    }
}

/// Classifies relations of one graph.
#[derive(Debug, Clone)]
pub struct GraphLayout {
    pub graph_name: String,
    pub twin_label: String,
}

impl GraphLayout {
    pub fn new(graph_name: impl Into<String>, twin_label: impl Into<String>) -> Self {
        Self {
            graph_name: graph_name.into(),
            twin_label: twin_label.into(),
        }
    }

    pub fn classify(&self, relation: &RelationInfo) -> RelationKind {
        if relation.namespace != self.graph_name {
            return RelationKind::Ignored;
        }
        if relation.column_index("start_id").is_some() && relation.column_index("end_id").is_some() {
            return RelationKind::Relationship;
        }
        if relation.name == self.twin_label {
            return RelationKind::Twin;
        }
        RelationKind::Ignored
    }
}

/// Read the `properties` snapshot of a tuple. `fallback` supplies the value
/// for an unchanged TOAST column.
fn snapshot(
    relation: &RelationInfo,
    tuple: &TupleData,
    fallback: Option<&Value>,
) -> std::result::Result<Value, String> {
    let index = relation
        .column_index(PROPERTIES_COLUMN)
        .ok_or_else(|| format!("{} has no {} column", relation.qualified_name(), PROPERTIES_COLUMN))?;

    match tuple.get(index) {
        Some(TupleValue::Text(text)) => parse_agtype(text),
        Some(TupleValue::UnchangedToast) => fallback
            .cloned()
            .ok_or_else(|| "unchanged TOAST value without a before-image".to_string()),
        Some(TupleValue::Null) | None => Err("properties column is null".to_string()),
        Some(TupleValue::Binary(_)) => Err("binary properties are not supported".to_string()),
    }
}

/// Parse the text form of an agtype map.
pub fn parse_agtype(text: &str) -> std::result::Result<Value, String> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_suffix("::vertex")
        .or_else(|| trimmed.strip_suffix("::edge"))
        .unwrap_or(trimmed);

    match serde_json::from_str::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("properties are not a JSON object".to_string()),
        Err(e) => Err(format!("unparsable properties: {}", e)),
    }
}

fn full_image<'a>(old: &'a (OldImage, TupleData), relation: &RelationInfo) -> std::result::Result<&'a TupleData, String> {
    match old {
        (OldImage::Full, tuple) => Ok(tuple),
        (OldImage::Key, _) => Err(format!(
            "{} sends key-only before-images; set REPLICA IDENTITY FULL",
            relation.qualified_name()
        )),
    }
}

/// Map one row change to an EventData record.
pub fn map_row_change(
    kind: RelationKind,
    relation: &RelationInfo,
    message: &PgOutputMessage,
    timestamp: DateTime<Utc>,
) -> DecodeOutcome {
    let (create, update, delete) = match kind {
        RelationKind::Twin => (EventType::TwinCreate, EventType::TwinUpdate, EventType::TwinDelete),
        RelationKind::Relationship => (
            EventType::RelationshipCreate,
            EventType::RelationshipUpdate,
            EventType::RelationshipDelete,
        ),
        RelationKind::Ignored => return DecodeOutcome::Control,
    };

    let result = match message {
        PgOutputMessage::Insert { new, .. } => {
            snapshot(relation, new, None).map(|new| EventData::new(create, None, Some(new)))
        }
        PgOutputMessage::Update { old, new, .. } => {
            let old = match old {
                Some(old) => full_image(old, relation).and_then(|t| snapshot(relation, t, None)),
                None => Err(format!(
                    "{} update without before-image; set REPLICA IDENTITY FULL",
                    relation.qualified_name()
                )),
            };
            old.and_then(|old| {
                let new = snapshot(relation, new, Some(&old))?;
                if old == new {
                    return Err("update left properties unchanged".to_string());
                }
                Ok(EventData::new(update, Some(old), Some(new)))
            })
        }
        PgOutputMessage::Delete { old, .. } => full_image(old, relation)
            .and_then(|t| snapshot(relation, t, None))
            .map(|old| EventData::new(delete, Some(old), None)),
        _ => return DecodeOutcome::Control,
    };

    match result {
        Ok(data) => DecodeOutcome::Event(data.with_timestamp(timestamp)),
        Err(reason) => DecodeOutcome::skip(reason),
    }
}

/// Records of every transaction completed within one peeked batch.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub records: Vec<EventData>,
    /// End of the last complete transaction; advancing the slot here
    /// confirms the batch.
    pub confirm_lsn: Option<Lsn>,
    pub transactions: usize,
    pub skipped: usize,
}

/// Stateful decoder: relation cache plus the open transaction.
pub struct ChangeDecoder {
    layout: GraphLayout,
    relations: HashMap<u32, (RelationKind, RelationInfo)>,
    commit_time: Option<DateTime<Utc>>,
    pending: Vec<EventData>,
}

impl ChangeDecoder {
    pub fn new(layout: GraphLayout) -> Self {
        Self {
            layout,
            relations: HashMap::new(),
            commit_time: None,
            pending: Vec::new(),
        }
    }

    pub fn relation(&self, oid: u32) -> Option<&RelationInfo> {
        self.relations.get(&oid).map(|(_, rel)| rel)
    }

    /// Interpret a single message, updating relation and transaction state.
    pub fn handle(&mut self, message: &PgOutputMessage) -> DecodeOutcome {
        match message {
            PgOutputMessage::Begin { commit_time, .. } => {
                self.commit_time = Some(*commit_time);
                DecodeOutcome::Control
            }
            PgOutputMessage::Relation(relation) => {
                let kind = self.layout.classify(relation);
                debug!(relation = %relation.qualified_name(), ?kind, "Relation registered");
                self.relations.insert(relation.oid, (kind, relation.clone()));
                DecodeOutcome::Control
            }
            PgOutputMessage::Insert { relation_id, .. }
            | PgOutputMessage::Update { relation_id, .. }
            | PgOutputMessage::Delete { relation_id, .. } => {
                let Some((kind, relation)) = self.relations.get(relation_id) else {
                    return DecodeOutcome::skip(format!("change for unknown relation {}", relation_id));
                };
                let timestamp = self.commit_time.unwrap_or_else(Utc::now);
                map_row_change(*kind, relation, message, timestamp)
            }
            PgOutputMessage::Truncate { relation_ids, .. } => {
                let graph_tables = relation_ids
                    .iter()
                    .filter(|oid| {
                        self.relations
                            .get(oid)
                            .map(|(kind, _)| *kind != RelationKind::Ignored)
                            .unwrap_or(false)
                    })
                    .count();
                if graph_tables > 0 {
                    return DecodeOutcome::skip("TRUNCATE on graph tables emits no events");
                }
                DecodeOutcome::Control
            }
            _ => DecodeOutcome::Control,
        }
    }

    /// Decode a batch of raw messages. Records are released only when their
    /// transaction commits; a trailing open transaction is discarded and will
    /// be read again by the next peek.
    pub fn decode_batch<I, B>(&mut self, messages: I) -> Result<DecodedBatch>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut batch = DecodedBatch::default();
        self.pending.clear();
        self.commit_time = None;

        for raw in messages {
            let message = match pgoutput::decode(raw.as_ref()) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable replication message");
                    EventMetrics::change_skipped("decode_error");
                    batch.skipped += 1;
                    continue;
                }
            };

            if let PgOutputMessage::Commit { end_lsn, .. } = message {
                for record in &self.pending {
                    EventMetrics::change_captured(record.event_type.as_str());
                }
                batch.records.append(&mut self.pending);
                batch.confirm_lsn = Some(end_lsn);
                batch.transactions += 1;
                self.commit_time = None;
                continue;
            }

            match self.handle(&message) {
                DecodeOutcome::Event(data) => self.pending.push(data),
                DecodeOutcome::Skip { reason } => {
                    warn!(tag = %message.tag(), %reason, "Skipping change");
                    EventMetrics::change_skipped("unmappable");
                    batch.skipped += 1;
                }
                DecodeOutcome::Control => {}
            }
        }

        if !self.pending.is_empty() {
            debug!(
                records = self.pending.len(),
                "Batch ended inside a transaction; it will be read again"
            );
            self.pending.clear();
        }

        Ok(batch)
    }
}

//! Decoder for the pgoutput logical replication protocol (version 1)
//!
//! Each row returned by `pg_logical_slot_peek_binary_changes` carries exactly
//! one protocol message.

use bytes::Buf;
use chrono::{DateTime, TimeZone, Utc};
use twincdc_core::{Result, TwinCdcError};

use crate::Lsn;

/// Microseconds between the Unix epoch and 2000-01-01, the PostgreSQL epoch.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Replica identity setting of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default,
    Nothing,
    Full,
    Index,
}

impl ReplicaIdentity {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'd' => Ok(ReplicaIdentity::Default),
            b'n' => Ok(ReplicaIdentity::Nothing),
            b'f' => Ok(ReplicaIdentity::Full),
            b'i' => Ok(ReplicaIdentity::Index),
            other => Err(decode_error(format!(
                "unknown replica identity '{}'",
                other as char
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    /// Part of the replica identity key.
    pub is_key: bool,
}

/// Relation description sent before the first change to a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    /// TOASTed value not included because it did not change.
    UnchangedToast,
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TupleData(pub Vec<TupleValue>);

impl TupleData {
    pub fn get(&self, index: usize) -> Option<&TupleValue> {
        self.0.get(index)
    }
}

/// Which image an update or delete carries for the old row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldImage {
    /// Only replica identity key columns.
    Key,
    /// The whole row (`REPLICA IDENTITY FULL`).
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PgOutputMessage {
    Begin {
        final_lsn: Lsn,
        commit_time: DateTime<Utc>,
        xid: u32,
    },
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: DateTime<Utc>,
    },
    Origin {
        lsn: Lsn,
        name: String,
    },
    Relation(RelationInfo),
    Type {
        oid: u32,
        namespace: String,
        name: String,
    },
    Insert {
        relation_id: u32,
        new: TupleData,
    },
    Update {
        relation_id: u32,
        old: Option<(OldImage, TupleData)>,
        new: TupleData,
    },
    Delete {
        relation_id: u32,
        old: (OldImage, TupleData),
    },
    Truncate {
        relation_ids: Vec<u32>,
        options: u8,
    },
    Message {
        transactional: bool,
        lsn: Lsn,
        prefix: String,
        content: Vec<u8>,
    },
}

impl PgOutputMessage {
    pub fn tag(&self) -> char {
        match self {
            PgOutputMessage::Begin { .. } => 'B',
            PgOutputMessage::Commit { .. } => 'C',
            PgOutputMessage::Origin { .. } => 'O',
            PgOutputMessage::Relation(_) => 'R',
            PgOutputMessage::Type { .. } => 'Y',
            PgOutputMessage::Insert { .. } => 'I',
            PgOutputMessage::Update { .. } => 'U',
            PgOutputMessage::Delete { .. } => 'D',
            PgOutputMessage::Truncate { .. } => 'T',
            PgOutputMessage::Message { .. } => 'M',
        }
    }
}

fn decode_error(msg: impl Into<String>) -> TwinCdcError {
    TwinCdcError::DecodeError(msg.into())
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(decode_error(format!(
            "truncated message reading {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_u8(buf: &mut &[u8], what: &str) -> Result<u8> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

fn read_i16(buf: &mut &[u8], what: &str) -> Result<i16> {
    need(buf, 2, what)?;
    Ok(buf.get_i16())
}

fn read_u32(buf: &mut &[u8], what: &str) -> Result<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32())
}

fn read_i32(buf: &mut &[u8], what: &str) -> Result<i32> {
    need(buf, 4, what)?;
    Ok(buf.get_i32())
}

fn read_lsn(buf: &mut &[u8], what: &str) -> Result<Lsn> {
    need(buf, 8, what)?;
    Ok(Lsn(buf.get_u64()))
}

fn read_timestamp(buf: &mut &[u8], what: &str) -> Result<DateTime<Utc>> {
    need(buf, 8, what)?;
    let micros = buf.get_i64().saturating_add(PG_EPOCH_OFFSET_MICROS);
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| decode_error(format!("timestamp out of range in {}", what)))
}

fn read_cstring(buf: &mut &[u8], what: &str) -> Result<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| decode_error(format!("unterminated string in {}", what)))?;
    let value = String::from_utf8(buf[..end].to_vec())
        .map_err(|_| decode_error(format!("invalid UTF-8 in {}", what)))?;
    buf.advance(end + 1);
    Ok(value)
}

fn read_bytes(buf: &mut &[u8], len: usize, what: &str) -> Result<Vec<u8>> {
    need(buf, len, what)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn read_tuple(buf: &mut &[u8]) -> Result<TupleData> {
    let count = read_i16(buf, "tuple column count")?;
    let mut values = Vec::with_capacity(count.max(0) as usize);

    for _ in 0..count {
        let value = match read_u8(buf, "tuple column kind")? {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::UnchangedToast,
            b't' => {
                let len = read_i32(buf, "text column length")?;
                let raw = read_bytes(buf, len.max(0) as usize, "text column")?;
                TupleValue::Text(
                    String::from_utf8(raw).map_err(|_| decode_error("invalid UTF-8 in text column"))?,
                )
            }
            b'b' => {
                let len = read_i32(buf, "binary column length")?;
                TupleValue::Binary(read_bytes(buf, len.max(0) as usize, "binary column")?)
            }
            other => {
                return Err(decode_error(format!(
                    "unknown tuple column kind '{}'",
                    other as char
                )))
            }
        };
        values.push(value);
    }

    Ok(TupleData(values))
}

fn read_relation(buf: &mut &[u8]) -> Result<RelationInfo> {
    let oid = read_u32(buf, "relation oid")?;
    let namespace = read_cstring(buf, "relation namespace")?;
    let name = read_cstring(buf, "relation name")?;
    let replica_identity = ReplicaIdentity::from_byte(read_u8(buf, "replica identity")?)?;
    let count = read_i16(buf, "relation column count")?;

    let mut columns = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let flags = read_u8(buf, "column flags")?;
        let name = read_cstring(buf, "column name")?;
        let type_oid = read_u32(buf, "column type")?;
        let type_modifier = read_i32(buf, "column type modifier")?;
        columns.push(ColumnInfo {
            name,
            type_oid,
            type_modifier,
            is_key: flags & 1 == 1,
        });
    }

    Ok(RelationInfo {
        oid,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

/// Decode one pgoutput message.
pub fn decode(data: &[u8]) -> Result<PgOutputMessage> {
    let mut buf = data;
    let tag = read_u8(&mut buf, "message tag")?;

    let message = match tag {
        b'B' => PgOutputMessage::Begin {
            final_lsn: read_lsn(&mut buf, "begin lsn")?,
            commit_time: read_timestamp(&mut buf, "begin timestamp")?,
            xid: read_u32(&mut buf, "begin xid")?,
        },
        b'C' => {
            let _flags = read_u8(&mut buf, "commit flags")?;
            PgOutputMessage::Commit {
                commit_lsn: read_lsn(&mut buf, "commit lsn")?,
                end_lsn: read_lsn(&mut buf, "commit end lsn")?,
                commit_time: read_timestamp(&mut buf, "commit timestamp")?,
            }
        }
        b'O' => PgOutputMessage::Origin {
            lsn: read_lsn(&mut buf, "origin lsn")?,
            name: read_cstring(&mut buf, "origin name")?,
        },
        b'R' => PgOutputMessage::Relation(read_relation(&mut buf)?),
        b'Y' => PgOutputMessage::Type {
            oid: read_u32(&mut buf, "type oid")?,
            namespace: read_cstring(&mut buf, "type namespace")?,
            name: read_cstring(&mut buf, "type name")?,
        },
        b'I' => {
            let relation_id = read_u32(&mut buf, "insert relation")?;
            match read_u8(&mut buf, "insert tuple marker")? {
                b'N' => PgOutputMessage::Insert {
                    relation_id,
                    new: read_tuple(&mut buf)?,
                },
                other => {
                    return Err(decode_error(format!(
                        "unexpected insert tuple marker '{}'",
                        other as char
                    )))
                }
            }
        }
        b'U' => {
            let relation_id = read_u32(&mut buf, "update relation")?;
            let mut old = None;
            let mut marker = read_u8(&mut buf, "update tuple marker")?;
            if marker == b'K' || marker == b'O' {
                let image = if marker == b'K' { OldImage::Key } else { OldImage::Full };
                old = Some((image, read_tuple(&mut buf)?));
                marker = read_u8(&mut buf, "update new tuple marker")?;
            }
            if marker != b'N' {
                return Err(decode_error(format!(
                    "unexpected update tuple marker '{}'",
                    marker as char
                )));
            }
            PgOutputMessage::Update {
                relation_id,
                old,
                new: read_tuple(&mut buf)?,
            }
        }
        b'D' => {
            let relation_id = read_u32(&mut buf, "delete relation")?;
            let image = match read_u8(&mut buf, "delete tuple marker")? {
                b'K' => OldImage::Key,
                b'O' => OldImage::Full,
                other => {
                    return Err(decode_error(format!(
                        "unexpected delete tuple marker '{}'",
                        other as char
                    )))
                }
            };
            PgOutputMessage::Delete {
                relation_id,
                old: (image, read_tuple(&mut buf)?),
            }
        }
        b'T' => {
            let count = read_u32(&mut buf, "truncate relation count")?;
            let options = read_u8(&mut buf, "truncate options")?;
            let mut relation_ids = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                relation_ids.push(read_u32(&mut buf, "truncate relation")?);
            }
            PgOutputMessage::Truncate {
                relation_ids,
                options,
            }
        }
        b'M' => {
            let flags = read_u8(&mut buf, "message flags")?;
            let lsn = read_lsn(&mut buf, "message lsn")?;
            let prefix = read_cstring(&mut buf, "message prefix")?;
            let len = read_u32(&mut buf, "message length")?;
            PgOutputMessage::Message {
                transactional: flags & 1 == 1,
                lsn,
                prefix,
                content: read_bytes(&mut buf, len as usize, "message content")?,
            }
        }
        other => {
            return Err(decode_error(format!(
                "unknown pgoutput message '{}'",
                other as char
            )))
        }
    };

    Ok(message)
}

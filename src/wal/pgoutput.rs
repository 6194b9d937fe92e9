// ABOUTME: pgoutput logical decoding: frame parsing, relation tracking, transaction buffering
// ABOUTME: Turns XLogData payloads into committed transactions of typed change records

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::catalog::StreamDescriptor;
use crate::error::{Result, SourceError};
use crate::slot::ReplicaIdentity;
use crate::wal::change::{ChangeRecord, CommittedTransaction, RowImage};
use crate::wal::protocol::{pg_timestamp_to_utc, FrameReader};
use crate::wal::Lsn;

pub const BOOL_OID: u32 = 16;
pub const INT8_OID: u32 = 20;
pub const INT2_OID: u32 = 21;
pub const INT4_OID: u32 = 23;
pub const TEXT_OID: u32 = 25;
pub const FLOAT4_OID: u32 = 700;
pub const FLOAT8_OID: u32 = 701;
pub const JSON_OID: u32 = 114;
pub const JSONB_OID: u32 = 3802;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    /// Part of the replica identity key
    pub is_key: bool,
}

/// Table shape as announced by the most recent Relation frame for its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSchema {
    pub id: u32,
    pub stream: StreamDescriptor,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    Null,
    /// TOASTed value not included because it did not change
    Unchanged,
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldTupleKind {
    /// `K`: replica identity key columns only
    Key,
    /// `O`: full old row
    Full,
}

/// One parsed pgoutput frame.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: Lsn,
        timestamp: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        timestamp: i64,
    },
    Relation(RelationSchema),
    Insert {
        relation_id: u32,
        new: Vec<TupleValue>,
    },
    Update {
        relation_id: u32,
        old: Option<(OldTupleKind, Vec<TupleValue>)>,
        new: Vec<TupleValue>,
    },
    Delete {
        relation_id: u32,
        old: (OldTupleKind, Vec<TupleValue>),
    },
    Truncate {
        options: u8,
        relation_ids: Vec<u32>,
    },
    Origin {
        lsn: Lsn,
        name: String,
    },
    Type {
        id: u32,
        namespace: String,
        name: String,
    },
    /// A tag this decoder does not know; skipped by the caller
    Unknown(u8),
}

/// Parse a single pgoutput frame. Unknown tags are returned as
/// [`LogicalMessage::Unknown`]; truncated or inconsistent frames fail.
pub fn parse_logical_message(data: &[u8]) -> Result<LogicalMessage> {
    let mut reader = FrameReader::new(data);
    let tag = reader.u8("message tag")?;
    let message = match tag {
        b'B' => LogicalMessage::Begin {
            final_lsn: reader.lsn("Begin final lsn")?,
            timestamp: reader.i64("Begin timestamp")?,
            xid: reader.u32("Begin xid")?,
        },
        b'C' => LogicalMessage::Commit {
            flags: reader.u8("Commit flags")?,
            commit_lsn: reader.lsn("Commit lsn")?,
            end_lsn: reader.lsn("Commit end lsn")?,
            timestamp: reader.i64("Commit timestamp")?,
        },
        b'R' => LogicalMessage::Relation(parse_relation(&mut reader)?),
        b'I' => {
            let relation_id = reader.u32("Insert relation id")?;
            expect_tag(&mut reader, b'N', "Insert")?;
            LogicalMessage::Insert {
                relation_id,
                new: parse_tuple(&mut reader)?,
            }
        }
        b'U' => {
            let relation_id = reader.u32("Update relation id")?;
            let old = match reader.u8("Update tuple tag")? {
                b'N' => None,
                kind @ (b'K' | b'O') => {
                    let old = parse_tuple(&mut reader)?;
                    expect_tag(&mut reader, b'N', "Update")?;
                    Some((old_kind(kind), old))
                }
                other => {
                    return Err(SourceError::decode(format!(
                        "unexpected tuple tag 0x{:02X} in Update",
                        other
                    )))
                }
            };
            LogicalMessage::Update {
                relation_id,
                old,
                new: parse_tuple(&mut reader)?,
            }
        }
        b'D' => {
            let relation_id = reader.u32("Delete relation id")?;
            let kind = match reader.u8("Delete tuple tag")? {
                kind @ (b'K' | b'O') => old_kind(kind),
                other => {
                    return Err(SourceError::decode(format!(
                        "unexpected tuple tag 0x{:02X} in Delete",
                        other
                    )))
                }
            };
            LogicalMessage::Delete {
                relation_id,
                old: (kind, parse_tuple(&mut reader)?),
            }
        }
        b'T' => {
            let count = reader.u32("Truncate relation count")?;
            let options = reader.u8("Truncate options")?;
            let mut relation_ids = Vec::new();
            for _ in 0..count {
                relation_ids.push(reader.u32("Truncate relation id")?);
            }
            LogicalMessage::Truncate {
                options,
                relation_ids,
            }
        }
        b'O' => LogicalMessage::Origin {
            lsn: reader.lsn("Origin lsn")?,
            name: reader.cstring("Origin name")?,
        },
        b'Y' => LogicalMessage::Type {
            id: reader.u32("Type id")?,
            namespace: reader.cstring("Type namespace")?,
            name: reader.cstring("Type name")?,
        },
        other => return Ok(LogicalMessage::Unknown(other)),
    };
    if reader.remaining() != 0 {
        return Err(SourceError::decode(format!(
            "{} trailing bytes after '{}' frame",
            reader.remaining(),
            tag as char
        )));
    }
    Ok(message)
}

fn old_kind(tag: u8) -> OldTupleKind {
    if tag == b'K' {
        OldTupleKind::Key
    } else {
        OldTupleKind::Full
    }
}

fn expect_tag(reader: &mut FrameReader<'_>, expected: u8, frame: &str) -> Result<()> {
    let tag = reader.u8("tuple tag")?;
    if tag != expected {
        return Err(SourceError::decode(format!(
            "expected '{}' tuple in {}, got 0x{:02X}",
            expected as char, frame, tag
        )));
    }
    Ok(())
}

fn parse_relation(reader: &mut FrameReader<'_>) -> Result<RelationSchema> {
    let id = reader.u32("Relation id")?;
    let namespace = reader.cstring("Relation namespace")?;
    let name = reader.cstring("Relation name")?;
    let identity = reader.u8("Relation replica identity")?;
    let replica_identity = ReplicaIdentity::from_code(identity as char).ok_or_else(|| {
        SourceError::decode(format!("unknown replica identity '{}'", identity as char))
    })?;
    let count = reader.u16("Relation column count")?;
    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let flags = reader.u8("column flags")?;
        columns.push(RelationColumn {
            name: reader.cstring("column name")?,
            type_oid: reader.u32("column type oid")?,
            type_modifier: reader.i32("column type modifier")?,
            is_key: flags & 1 != 0,
        });
    }
    Ok(RelationSchema {
        id,
        stream: StreamDescriptor::new(namespace, name),
        replica_identity,
        columns,
    })
}

fn parse_tuple(reader: &mut FrameReader<'_>) -> Result<Vec<TupleValue>> {
    let count = reader.u16("tuple column count")?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let value = match reader.u8("tuple value kind")? {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::Unchanged,
            b't' => {
                let len = reader.i32("text value length")?;
                let len = usize::try_from(len)
                    .map_err(|_| SourceError::decode(format!("negative text length {}", len)))?;
                let raw = reader.bytes(len, "text value")?;
                let text = std::str::from_utf8(raw)
                    .map_err(|e| SourceError::decode(format!("invalid UTF-8 column value: {}", e)))?;
                TupleValue::Text(text.to_string())
            }
            other => {
                return Err(SourceError::decode(format!(
                    "unsupported tuple value kind 0x{:02X}",
                    other
                )))
            }
        };
        values.push(value);
    }
    Ok(values)
}

/// Convert a pgoutput text value into JSON by column type.
pub fn text_to_json(type_oid: u32, text: &str) -> serde_json::Value {
    use serde_json::Value;
    match type_oid {
        BOOL_OID => match text {
            "t" | "true" => Value::Bool(true),
            "f" | "false" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        INT2_OID | INT4_OID | INT8_OID => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        FLOAT4_OID | FLOAT8_OID => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        JSON_OID | JSONB_OID => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        _ => Value::String(text.to_string()),
    }
}

struct TransactionBuffer {
    xid: u32,
    final_lsn: Lsn,
    changes: Vec<ChangeRecord>,
}

/// Stateful pgoutput decoder for one replication connection.
///
/// Owns the relation-id to schema map; it is changed only by Relation
/// frames and can be read but never modified from outside.
#[derive(Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationSchema>,
    in_flight: Option<TransactionBuffer>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: u32) -> Option<&RelationSchema> {
        self.relations.get(&id)
    }

    pub fn in_transaction(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Forget the partial transaction and relation map. The server resends
    /// Relation frames on a new connection before any row that needs them.
    pub fn reset(&mut self) {
        if let Some(txn) = self.in_flight.take() {
            tracing::debug!(
                "Discarding {} buffered change(s) of uncommitted transaction {}",
                txn.changes.len(),
                txn.xid
            );
        }
        self.relations.clear();
    }

    /// Feed one XLogData payload; returns a transaction once its Commit arrives.
    pub fn decode(&mut self, data: &[u8]) -> Result<Option<CommittedTransaction>> {
        match parse_logical_message(data)? {
            LogicalMessage::Begin {
                final_lsn, xid, ..
            } => {
                if let Some(open) = &self.in_flight {
                    return Err(SourceError::decode(format!(
                        "Begin of transaction {} while transaction {} is still open",
                        xid, open.xid
                    )));
                }
                self.in_flight = Some(TransactionBuffer {
                    xid,
                    final_lsn,
                    changes: Vec::new(),
                });
                Ok(None)
            }
            LogicalMessage::Commit {
                commit_lsn,
                end_lsn,
                timestamp,
                ..
            } => {
                let txn = self
                    .in_flight
                    .take()
                    .ok_or_else(|| SourceError::decode("Commit without a matching Begin"))?;
                if txn.final_lsn != commit_lsn {
                    return Err(SourceError::decode(format!(
                        "Commit lsn {} does not match Begin final lsn {} for transaction {}",
                        commit_lsn, txn.final_lsn, txn.xid
                    )));
                }
                let commit_timestamp = pg_timestamp_to_utc(timestamp);
                Ok(Some(finish_transaction(txn, commit_lsn, end_lsn, commit_timestamp)))
            }
            LogicalMessage::Relation(schema) => {
                if let Some(previous) = self.relations.get(&schema.id) {
                    if previous.columns != schema.columns {
                        tracing::info!(
                            "Schema of {} changed: {} -> {} column(s)",
                            schema.stream,
                            previous.columns.len(),
                            schema.columns.len()
                        );
                    }
                }
                self.relations.insert(schema.id, schema);
                Ok(None)
            }
            LogicalMessage::Insert { relation_id, new } => {
                let schema = self.schema_for(relation_id)?;
                let after = tuple_to_image(schema, &new, None, false)?;
                let record = ChangeRecord::insert(schema.stream.clone(), after);
                self.buffer(record)?;
                Ok(None)
            }
            LogicalMessage::Update {
                relation_id,
                old,
                new,
            } => {
                let schema = self.schema_for(relation_id)?;
                let before = match &old {
                    Some((kind, tuple)) => {
                        Some(tuple_to_image(schema, tuple, None, *kind == OldTupleKind::Key)?)
                    }
                    None => None,
                };
                let after = tuple_to_image(schema, &new, before.as_ref(), false)?;
                let record = ChangeRecord::update(schema.stream.clone(), before, after);
                self.buffer(record)?;
                Ok(None)
            }
            LogicalMessage::Delete {
                relation_id,
                old: (kind, tuple),
            } => {
                let schema = self.schema_for(relation_id)?;
                let before = tuple_to_image(schema, &tuple, None, kind == OldTupleKind::Key)?;
                let record = ChangeRecord::delete(schema.stream.clone(), before);
                self.buffer(record)?;
                Ok(None)
            }
            LogicalMessage::Truncate { relation_ids, .. } => {
                let names: Vec<String> = relation_ids
                    .iter()
                    .map(|id| {
                        self.relations
                            .get(id)
                            .map(|r| r.stream.to_string())
                            .unwrap_or_else(|| format!("relation {}", id))
                    })
                    .collect();
                tracing::warn!(
                    "TRUNCATE of {} is not replicated as row changes; run a full refresh to resync",
                    names.join(", ")
                );
                Ok(None)
            }
            LogicalMessage::Origin { name, .. } => {
                tracing::debug!("Transaction originates from {}", name);
                Ok(None)
            }
            LogicalMessage::Type { namespace, name, .. } => {
                tracing::debug!("Type announcement for {}.{}", namespace, name);
                Ok(None)
            }
            LogicalMessage::Unknown(tag) => {
                tracing::warn!("Skipping unknown pgoutput message type 0x{:02X}", tag);
                Ok(None)
            }
        }
    }

    fn schema_for(&self, relation_id: u32) -> Result<&RelationSchema> {
        self.relations.get(&relation_id).ok_or_else(|| {
            SourceError::decode(format!(
                "row change for relation {} arrived before its Relation frame",
                relation_id
            ))
        })
    }

    fn buffer(&mut self, record: ChangeRecord) -> Result<()> {
        match &mut self.in_flight {
            Some(txn) => {
                txn.changes.push(record);
                Ok(())
            }
            None => Err(SourceError::decode(format!(
                "row change for {} outside of a transaction",
                record.stream()
            ))),
        }
    }
}

fn finish_transaction(
    txn: TransactionBuffer,
    commit_lsn: Lsn,
    end_lsn: Lsn,
    commit_timestamp: DateTime<Utc>,
) -> CommittedTransaction {
    let mut changes = txn.changes;
    for change in &mut changes {
        change.stamp(commit_lsn, commit_timestamp);
    }
    CommittedTransaction {
        xid: txn.xid,
        commit_lsn,
        end_lsn,
        commit_timestamp,
        changes,
    }
}

/// Build a row image. Unchanged TOAST columns take the value from `before`
/// when it has one and are omitted otherwise. `key_only` drops columns
/// outside the replica identity key.
fn tuple_to_image(
    schema: &RelationSchema,
    tuple: &[TupleValue],
    before: Option<&RowImage>,
    key_only: bool,
) -> Result<RowImage> {
    if tuple.len() != schema.columns.len() {
        return Err(SourceError::decode(format!(
            "tuple for {} has {} column(s) but its Relation declares {}",
            schema.stream,
            tuple.len(),
            schema.columns.len()
        )));
    }
    let mut image = RowImage::new();
    for (column, value) in schema.columns.iter().zip(tuple) {
        if key_only && !column.is_key {
            continue;
        }
        match value {
            TupleValue::Null => {
                image.insert(column.name.clone(), serde_json::Value::Null);
            }
            TupleValue::Text(text) => {
                image.insert(column.name.clone(), text_to_json(column.type_oid, text));
            }
            TupleValue::Unchanged => {
                if let Some(previous) = before.and_then(|b| b.get(&column.name)) {
                    image.insert(column.name.clone(), previous.clone());
                }
            }
        }
    }
    Ok(image)
}

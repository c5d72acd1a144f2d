//! pgoutput message decoding
//!
//! Decodes the logical replication messages PostgreSQL emits for a
//! publication with `proto_version '1'`. Each XLogData frame carries exactly
//! one of these.

use bytes::{Buf, Bytes};
use thiserror::Error;

/// Decoder errors
#[derive(Error, Debug)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessage(u8),
    #[error("unknown tuple marker 0x{0:02x}")]
    UnknownTupleMarker(u8),
    #[error("string is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// A decoded logical replication message
#[derive(Debug, Clone)]
pub enum LogicalMessage {
    /// Transaction start
    Begin(BeginMessage),
    /// Transaction end
    Commit(CommitMessage),
    /// Table schema; sent before the first row message for each relation
    Relation(RelationMessage),
    /// Row inserted
    Insert(InsertMessage),
    /// Row updated
    Update(UpdateMessage),
    /// Row deleted
    Delete(DeleteMessage),
    /// Tables truncated
    Truncate(TruncateMessage),
    /// Replication origin; carries nothing weir needs
    Origin,
    /// Data type declaration; carries nothing weir needs
    Type,
}

/// BEGIN
#[derive(Debug, Clone)]
pub struct BeginMessage {
    /// LSN of the transaction's eventual commit record
    pub final_lsn: u64,
    /// Commit timestamp, microseconds since the PostgreSQL epoch
    pub timestamp: i64,
    /// Transaction id
    pub xid: u32,
}

/// COMMIT
#[derive(Debug, Clone)]
pub struct CommitMessage {
    pub flags: u8,
    /// LSN of the commit record
    pub commit_lsn: u64,
    /// LSN just past the commit record; resuming here skips the transaction
    pub end_lsn: u64,
    /// Commit timestamp, microseconds since the PostgreSQL epoch
    pub timestamp: i64,
}

/// RELATION: the column layout row messages refer back to by oid
#[derive(Debug, Clone)]
pub struct RelationMessage {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnDescription>,
}

/// One column within a relation message
#[derive(Debug, Clone)]
pub struct ColumnDescription {
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

/// INSERT
#[derive(Debug, Clone)]
pub struct InsertMessage {
    pub relation_oid: u32,
    pub new_tuple: TupleData,
}

/// UPDATE
#[derive(Debug, Clone)]
pub struct UpdateMessage {
    pub relation_oid: u32,
    /// Old key or full old row, present when the replica identity provides it
    pub old_tuple: Option<TupleData>,
    pub new_tuple: TupleData,
}

/// DELETE
#[derive(Debug, Clone)]
pub struct DeleteMessage {
    pub relation_oid: u32,
    /// Key columns (or full row with REPLICA IDENTITY FULL)
    pub old_tuple: TupleData,
}

/// TRUNCATE
#[derive(Debug, Clone)]
pub struct TruncateMessage {
    pub options: u8,
    pub relation_oids: Vec<u32>,
}

/// Column values within a row message
#[derive(Debug, Clone)]
pub struct TupleData(pub Vec<TupleValue>);

/// One column's wire value
#[derive(Debug, Clone)]
pub enum TupleValue {
    /// SQL NULL
    Null,
    /// Unchanged TOASTed value, omitted from the message
    Unchanged,
    /// Text-format value
    Text(Bytes),
}

/// Decode one logical replication message.
pub fn decode_message(buf: &mut Bytes) -> Result<LogicalMessage, WireError> {
    match get_u8(buf)? {
        b'B' => Ok(LogicalMessage::Begin(BeginMessage {
            final_lsn: get_u64(buf)?,
            timestamp: get_i64(buf)?,
            xid: get_u32(buf)?,
        })),
        b'C' => Ok(LogicalMessage::Commit(CommitMessage {
            flags: get_u8(buf)?,
            commit_lsn: get_u64(buf)?,
            end_lsn: get_u64(buf)?,
            timestamp: get_i64(buf)?,
        })),
        b'R' => decode_relation(buf),
        b'I' => {
            let relation_oid = get_u32(buf)?;
            match get_u8(buf)? {
                b'N' => Ok(LogicalMessage::Insert(InsertMessage {
                    relation_oid,
                    new_tuple: decode_tuple_data(buf)?,
                })),
                other => Err(WireError::Protocol(format!(
                    "insert carries unexpected tuple marker 0x{other:02x}"
                ))),
            }
        }
        b'U' => decode_update(buf),
        b'D' => {
            let relation_oid = get_u32(buf)?;
            match get_u8(buf)? {
                b'K' | b'O' => Ok(LogicalMessage::Delete(DeleteMessage {
                    relation_oid,
                    old_tuple: decode_tuple_data(buf)?,
                })),
                other => Err(WireError::UnknownTupleMarker(other)),
            }
        }
        b'T' => {
            let count = get_u32(buf)? as usize;
            let options = get_u8(buf)?;
            let mut relation_oids = Vec::with_capacity(count);
            for _ in 0..count {
                relation_oids.push(get_u32(buf)?);
            }
            Ok(LogicalMessage::Truncate(TruncateMessage {
                options,
                relation_oids,
            }))
        }
        b'O' => Ok(LogicalMessage::Origin),
        b'Y' => Ok(LogicalMessage::Type),
        other => Err(WireError::UnknownMessage(other)),
    }
}

fn decode_relation(buf: &mut Bytes) -> Result<LogicalMessage, WireError> {
    let oid = get_u32(buf)?;
    let namespace = get_cstr(buf)?;
    let name = get_cstr(buf)?;
    let replica_identity = get_u8(buf)?;
    let count = get_u16(buf)? as usize;

    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        columns.push(ColumnDescription {
            flags: get_u8(buf)?,
            name: get_cstr(buf)?,
            type_oid: get_u32(buf)?,
            type_modifier: get_i32(buf)?,
        });
    }

    Ok(LogicalMessage::Relation(RelationMessage {
        oid,
        namespace,
        name,
        replica_identity,
        columns,
    }))
}

fn decode_update(buf: &mut Bytes) -> Result<LogicalMessage, WireError> {
    let relation_oid = get_u32(buf)?;
    let (old_tuple, marker) = match get_u8(buf)? {
        b'K' | b'O' => {
            let old = decode_tuple_data(buf)?;
            (Some(old), get_u8(buf)?)
        }
        marker => (None, marker),
    };
    if marker != b'N' {
        return Err(WireError::Protocol(format!(
            "update carries unexpected tuple marker 0x{marker:02x}"
        )));
    }
    Ok(LogicalMessage::Update(UpdateMessage {
        relation_oid,
        old_tuple,
        new_tuple: decode_tuple_data(buf)?,
    }))
}

fn decode_tuple_data(buf: &mut Bytes) -> Result<TupleData, WireError> {
    let count = get_u16(buf)? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let value = match get_u8(buf)? {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::Unchanged,
            b't' => {
                let len = get_u32(buf)? as usize;
                if buf.remaining() < len {
                    return Err(WireError::Truncated);
                }
                TupleValue::Text(buf.copy_to_bytes(len))
            }
            other => return Err(WireError::UnknownTupleMarker(other)),
        };
        values.push(value);
    }
    Ok(TupleData(values))
}

fn get_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut Bytes) -> Result<i32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_i32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut Bytes) -> Result<i64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_i64())
}

fn get_cstr(buf: &mut Bytes) -> Result<String, WireError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::Truncated)?;
    let raw = buf.copy_to_bytes(end);
    buf.advance(1); // null terminator
    Ok(std::str::from_utf8(&raw)?.to_string())
}

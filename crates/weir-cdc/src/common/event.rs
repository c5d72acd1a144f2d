//! Change events and log positions
//!
//! The replication reader turns decoded wire messages into
//! [`ReplicationEvent`]s; the backfill scanner produces bare
//! [`ChangeEvent`]s. Both flow into the interleaver, which is the only
//! consumer.

use crate::common::value::ColumnValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Schema assumed when a stream does not name one.
pub const DEFAULT_SCHEMA: &str = "public";

/// A position in the logical replication log.
///
/// Opaque and totally ordered; the textual form is PostgreSQL's `X/X`
/// notation, which is also how it serializes inside state checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid LSN {s:?}"))?;
        let high = u64::from_str_radix(high, 16).map_err(|e| format!("invalid LSN {s:?}: {e}"))?;
        let low = u64::from_str_radix(low, 16).map_err(|e| format!("invalid LSN {s:?}: {e}"))?;
        Ok(Lsn((high << 32) | low))
    }
}

impl Serialize for Lsn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Row inserted (or read during backfill)
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Insert => write!(f, "Insert"),
            ChangeOp::Update => write!(f, "Update"),
            ChangeOp::Delete => write!(f, "Delete"),
        }
    }
}

/// One row change on one table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// What happened
    pub op: ChangeOp,
    /// Schema name
    pub namespace: String,
    /// Table name
    pub table: String,
    /// Column values. For deletes only the replica-identity columns carry
    /// values; the rest are null.
    pub fields: BTreeMap<String, ColumnValue>,
    /// Position of this change in the replication log; zero for backfill
    /// rows, which have no log position of their own.
    pub lsn: Lsn,
}

impl ChangeEvent {
    /// The normalized stream id this event belongs to.
    pub fn stream_id(&self) -> String {
        stream_id(&self.namespace, &self.table)
    }
}

/// An event surfaced by the replication reader.
///
/// Row changes arrive between a matching Begin/Commit pair, in source order.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// Transaction started
    Begin {
        /// Final LSN of the transaction
        lsn: Lsn,
    },
    /// Transaction committed
    Commit {
        /// End LSN of the commit record; replay from here skips the
        /// transaction entirely
        lsn: Lsn,
    },
    /// A row changed
    Change(ChangeEvent),
}

/// Combine a namespace and table name into a fully-qualified, case-normalized
/// stream identifier. An empty namespace falls back to [`DEFAULT_SCHEMA`].
pub fn stream_id(namespace: &str, table: &str) -> String {
    let namespace = if namespace.is_empty() {
        DEFAULT_SCHEMA
    } else {
        namespace
    };
    format!("{}.{}", namespace, table).to_lowercase()
}

//! Column values
//!
//! A closed enumeration of the driver value kinds weir understands, shared by
//! the backfill scanner (which decodes binary driver values) and the
//! replication reader (which parses pgoutput text values by type OID). Both
//! sides producing the same representation is what makes a replication
//! event's row key comparable against a scanned-position key.
//!
//! `into_json` is the record translator: it maps each kind onto a
//! wire-serializable scalar. Network types use their canonical text forms,
//! UUIDs are hyphenated, byte strings become hex text, and JSON columns pass
//! through structurally.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use cidr::{IpCidr, IpInet};
use eui48::{MacAddress, MacAddressFormat};

/// One column's value, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// SQL NULL
    Null,
    /// boolean
    Bool(bool),
    /// smallint, integer, bigint, oid
    Int(i64),
    /// real, double precision
    Float(f64),
    /// numeric, kept in text form to preserve precision
    Numeric(String),
    /// text, varchar, char(n), name
    Text(String),
    /// bytea
    Bytes(Vec<u8>),
    /// uuid
    Uuid(uuid::Uuid),
    /// inet
    Inet(IpInet),
    /// cidr
    Cidr(IpCidr),
    /// macaddr
    MacAddr(MacAddress),
    /// date
    Date(NaiveDate),
    /// time without time zone
    Time(NaiveTime),
    /// timestamp without time zone
    Timestamp(NaiveDateTime),
    /// timestamp with time zone
    TimestampTz(DateTime<Utc>),
    /// json, jsonb
    Json(serde_json::Value),
}

impl ColumnValue {
    /// Translate into a wire-serializable JSON scalar.
    pub fn into_json(self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Bool(v) => Value::Bool(v),
            ColumnValue::Int(v) => Value::Number(v.into()),
            ColumnValue::Float(v) => serde_json::Number::from_f64(v)
                .map(Value::Number)
                // NaN and the infinities have no JSON number form
                .unwrap_or_else(|| Value::String(v.to_string())),
            ColumnValue::Numeric(v) => Value::String(v),
            ColumnValue::Text(v) => Value::String(v),
            ColumnValue::Bytes(v) => Value::String(hex::encode(v)),
            ColumnValue::Uuid(v) => Value::String(v.to_string()),
            ColumnValue::Inet(v) => Value::String(v.to_string()),
            ColumnValue::Cidr(v) => Value::String(v.to_string()),
            ColumnValue::MacAddr(v) => {
                // HexString is the colon-separated form PostgreSQL itself
                // prints for macaddr values.
                Value::String(v.to_string(MacAddressFormat::HexString))
            }
            ColumnValue::Date(v) => Value::String(v.to_string()),
            ColumnValue::Time(v) => Value::String(v.to_string()),
            ColumnValue::Timestamp(v) => Value::String(v.to_string()),
            ColumnValue::TimestampTz(v) => Value::String(v.to_rfc3339()),
            ColumnValue::Json(v) => v,
        }
    }

    /// Short kind name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            ColumnValue::Null => "null",
            ColumnValue::Bool(_) => "bool",
            ColumnValue::Int(_) => "int",
            ColumnValue::Float(_) => "float",
            ColumnValue::Numeric(_) => "numeric",
            ColumnValue::Text(_) => "text",
            ColumnValue::Bytes(_) => "bytes",
            ColumnValue::Uuid(_) => "uuid",
            ColumnValue::Inet(_) => "inet",
            ColumnValue::Cidr(_) => "cidr",
            ColumnValue::MacAddr(_) => "macaddr",
            ColumnValue::Date(_) => "date",
            ColumnValue::Time(_) => "time",
            ColumnValue::Timestamp(_) => "timestamp",
            ColumnValue::TimestampTz(_) => "timestamptz",
            ColumnValue::Json(_) => "json",
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Int(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::Text(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}

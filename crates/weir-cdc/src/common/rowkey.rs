//! Row-key tuple codec
//!
//! A lexicographical order-preserving binary encoding for scan-key tuples.
//! Comparing two encoded keys with plain unsigned byte comparison gives the
//! same answer as comparing the tuples element-wise, which is what lets the
//! interleaver decide "already backfilled or not" with a single `<=` on
//! opaque bytes.
//!
//! Each element is written as a type tag followed by the payload:
//!
//! * null: tag only.
//! * booleans: false and true get distinct tags so they order correctly.
//! * integers: big-endian i64 with the sign bit flipped.
//! * floats: big-endian f64 bits, sign bit flipped, all bits flipped when
//!   negative.
//! * byte strings and text: `0x00` escaped as `0x00 0xff`, terminated with
//!   `0x00 0x00`.
//! * uuids: the 16 raw bytes.
//!
//! The tuple ends with a `0x00` terminator byte. No element tag is `0x00`,
//! so a shorter tuple orders before any extension of itself and no encoding
//! is a prefix of another.
//!
//! The encoding is not self-describing beyond the tags; `decode_tuple` exists
//! so a resumed capture can turn a persisted key back into query parameters.

use crate::common::error::{CaptureError, Result};
use crate::common::value::ColumnValue;
use std::collections::BTreeMap;

const TERMINATOR: u8 = 0x00;

const TAG_NULL: u8 = 0x05;
const TAG_FALSE: u8 = 0x06;
const TAG_TRUE: u8 = 0x07;
const TAG_INT: u8 = 0x10;
const TAG_FLOAT: u8 = 0x18;
const TAG_BYTES: u8 = 0x20;
const TAG_TEXT: u8 = 0x21;
const TAG_UUID: u8 = 0x30;

/// Encode a tuple of values into an order-preserving byte key.
pub fn encode_tuple(values: &[ColumnValue]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(values.len() * 9 + 1);
    for value in values {
        encode_value(value, &mut out)?;
    }
    out.push(TERMINATOR);
    Ok(out)
}

/// Decode a key produced by [`encode_tuple`].
pub fn decode_tuple(mut input: &[u8]) -> Result<Vec<ColumnValue>> {
    let mut values = Vec::new();
    loop {
        let (&tag, rest) = input
            .split_first()
            .ok_or_else(|| CaptureError::decode("row key is missing its terminator"))?;
        if tag == TERMINATOR {
            if !rest.is_empty() {
                return Err(CaptureError::decode("trailing bytes after row key"));
            }
            return Ok(values);
        }
        let (value, rest) = decode_value(tag, rest)?;
        values.push(value);
        input = rest;
    }
}

/// Extract the named scan-key columns from a row and encode them.
pub fn encode_row_key(
    key_columns: &[String],
    fields: &BTreeMap<String, ColumnValue>,
) -> Result<Vec<u8>> {
    let mut values = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        let value = fields.get(column).ok_or_else(|| {
            CaptureError::schema(format!("row is missing scan-key column {column:?}"))
        })?;
        values.push(value.clone());
    }
    encode_tuple(&values)
}

fn encode_value(value: &ColumnValue, out: &mut Vec<u8>) -> Result<()> {
    match value {
        ColumnValue::Null => out.push(TAG_NULL),
        ColumnValue::Bool(false) => out.push(TAG_FALSE),
        ColumnValue::Bool(true) => out.push(TAG_TRUE),
        ColumnValue::Int(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
        }
        ColumnValue::Float(v) => {
            out.push(TAG_FLOAT);
            let bits = v.to_bits();
            let ordered = if bits & (1 << 63) == 0 {
                bits ^ (1 << 63)
            } else {
                !bits
            };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        ColumnValue::Bytes(v) => {
            out.push(TAG_BYTES);
            encode_escaped(v, out);
        }
        ColumnValue::Text(v) => {
            out.push(TAG_TEXT);
            encode_escaped(v.as_bytes(), out);
        }
        ColumnValue::Uuid(v) => {
            out.push(TAG_UUID);
            out.extend_from_slice(v.as_bytes());
        }
        other => {
            return Err(CaptureError::schema(format!(
                "{} columns cannot be used in a scan key",
                other.kind()
            )));
        }
    }
    Ok(())
}

fn decode_value(tag: u8, input: &[u8]) -> Result<(ColumnValue, &[u8])> {
    match tag {
        TAG_NULL => Ok((ColumnValue::Null, input)),
        TAG_FALSE => Ok((ColumnValue::Bool(false), input)),
        TAG_TRUE => Ok((ColumnValue::Bool(true), input)),
        TAG_INT => {
            let (bytes, rest) = take_fixed::<8>(input)?;
            let v = (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64;
            Ok((ColumnValue::Int(v), rest))
        }
        TAG_FLOAT => {
            let (bytes, rest) = take_fixed::<8>(input)?;
            let ordered = u64::from_be_bytes(bytes);
            let bits = if ordered & (1 << 63) != 0 {
                ordered ^ (1 << 63)
            } else {
                !ordered
            };
            Ok((ColumnValue::Float(f64::from_bits(bits)), rest))
        }
        TAG_BYTES => {
            let (bytes, rest) = decode_escaped(input)?;
            Ok((ColumnValue::Bytes(bytes), rest))
        }
        TAG_TEXT => {
            let (bytes, rest) = decode_escaped(input)?;
            let text = String::from_utf8(bytes)
                .map_err(|e| CaptureError::decode(format!("row key text is not UTF-8: {e}")))?;
            Ok((ColumnValue::Text(text), rest))
        }
        TAG_UUID => {
            let (bytes, rest) = take_fixed::<16>(input)?;
            Ok((ColumnValue::Uuid(uuid::Uuid::from_bytes(bytes)), rest))
        }
        other => Err(CaptureError::decode(format!(
            "unknown row key tag 0x{other:02x}"
        ))),
    }
}

fn encode_escaped(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        if b == 0x00 {
            out.extend_from_slice(&[0x00, 0xff]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}

fn decode_escaped(mut input: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut data = Vec::new();
    loop {
        match input {
            [0x00, 0x00, rest @ ..] => return Ok((data, rest)),
            [0x00, 0xff, rest @ ..] => {
                data.push(0x00);
                input = rest;
            }
            [0x00, ..] => return Err(CaptureError::decode("invalid escape in row key")),
            [b, rest @ ..] => {
                data.push(*b);
                input = rest;
            }
            [] => return Err(CaptureError::decode("unterminated byte string in row key")),
        }
    }
}

fn take_fixed<const N: usize>(input: &[u8]) -> Result<([u8; N], &[u8])> {
    if input.len() < N {
        return Err(CaptureError::decode("truncated row key"));
    }
    let (head, rest) = input.split_at(N);
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(head);
    Ok((bytes, rest))
}

//! Buffered backfill chunks
//!
//! Holds the rows returned by the most recent chunk scan of each stream,
//! keyed by encoded row key. While the interleaver drains replication events
//! up to the next watermark, events landing inside a buffered chunk's key
//! range are patched into the buffer, so the chunk is emitted with every
//! row's latest committed value instead of the snapshot the scan happened to
//! see. Events beyond the chunk belong to a later scan and are dropped.

use crate::common::error::{CaptureError, Result};
use crate::common::event::{ChangeEvent, ChangeOp};
use crate::common::rowkey::encode_row_key;
use std::collections::BTreeMap;
use tracing::debug;

/// One stream's buffered chunk.
#[derive(Debug)]
struct Chunk {
    /// Scan-key columns used to derive row keys
    key_columns: Vec<String>,
    /// Rows by encoded key; iteration order is emission order
    rows: BTreeMap<Vec<u8>, ChangeEvent>,
    /// Whether the chunk was shorter than the chunk size, meaning the scan
    /// has reached the end of the table
    complete: bool,
    /// Highest key the scan returned, regardless of later patches
    scanned: Option<Vec<u8>>,
}

/// A flushed chunk, ready for emission.
#[derive(Debug)]
pub struct FlushedChunk {
    /// Rows in encoded-key ascending order
    pub events: Vec<ChangeEvent>,
    /// Whether the stream's backfill is finished
    pub complete: bool,
    /// Resume key for the next scan
    pub scanned: Option<Vec<u8>>,
}

/// The set of buffered chunks for one backfill cycle.
#[derive(Debug, Default)]
pub struct ResultSet {
    streams: BTreeMap<String, Chunk>,
}

impl ResultSet {
    /// Create an empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the most recent chunk scanned for a stream.
    pub fn buffer(
        &mut self,
        stream_id: impl Into<String>,
        key_columns: Vec<String>,
        events: Vec<ChangeEvent>,
        complete: bool,
    ) -> Result<()> {
        let mut rows = BTreeMap::new();
        let mut scanned = None;
        for event in events {
            let key = encode_row_key(&key_columns, &event.fields)?;
            if let Some(prev) = &scanned {
                if key <= *prev {
                    return Err(CaptureError::invalid_state(
                        "scan returned rows out of key order",
                    ));
                }
            }
            scanned = Some(key.clone());
            rows.insert(key, event);
        }
        self.streams.insert(
            stream_id.into(),
            Chunk {
                key_columns,
                rows,
                complete,
                scanned,
            },
        );
        Ok(())
    }

    /// Apply a replication event to the buffered chunk for its stream.
    ///
    /// Inserts and updates overwrite the buffered row; deletes remove it. An
    /// event for a stream with no buffered chunk, or beyond the chunk's key
    /// range, is dropped: the row's state will be picked up by a later scan.
    pub fn patch(&mut self, stream_id: &str, event: ChangeEvent) -> Result<()> {
        let chunk = match self.streams.get_mut(stream_id) {
            Some(chunk) => chunk,
            None => {
                debug!(stream = %stream_id, "dropping event with no buffered chunk");
                return Ok(());
            }
        };

        let key = encode_row_key(&chunk.key_columns, &event.fields)?;
        let in_range = match &chunk.scanned {
            Some(max) => key <= *max,
            // An empty chunk buffers nothing; the row does not exist from
            // the merged stream's perspective yet.
            None => false,
        };
        if !in_range {
            debug!(stream = %stream_id, "dropping event beyond the buffered chunk");
            return Ok(());
        }

        match event.op {
            ChangeOp::Insert | ChangeOp::Update => {
                // Buffered rows are emitted as inserts: from the merged
                // stream's perspective this row is appearing for the first
                // time, in its latest state.
                let mut event = event;
                event.op = ChangeOp::Insert;
                chunk.rows.insert(key, event);
            }
            ChangeOp::Delete => {
                chunk.rows.remove(&key);
            }
        }
        Ok(())
    }

    /// Stream ids with buffered chunks, in sorted order.
    pub fn streams(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    /// Whether any chunks are buffered.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Remove and return a stream's chunk for emission.
    pub fn take(&mut self, stream_id: &str) -> Option<FlushedChunk> {
        self.streams.remove(stream_id).map(|chunk| FlushedChunk {
            events: chunk.rows.into_values().collect(),
            complete: chunk.complete,
            scanned: chunk.scanned,
        })
    }
}

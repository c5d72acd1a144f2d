//! Database-agnostic capture machinery
//!
//! - [`CaptureError`] / [`Result`] - error surface of the whole crate
//! - [`ColumnValue`] - closed enumeration of driver value kinds and the
//!   record translation to wire JSON
//! - [`rowkey`] - order-preserving scan-key tuple codec
//! - [`ChangeEvent`] / [`ReplicationEvent`] / [`Lsn`] - the event model
//! - [`ResultSet`] - buffered backfill chunks accepting replication patches
//! - [`PersistentState`] - resumable capture state and catalog reconciliation

mod buffer;
mod error;
mod event;
pub mod rowkey;
mod state;
mod value;

pub use buffer::{FlushedChunk, ResultSet};
pub use error::{CaptureError, ErrorCategory, Result};
pub use event::{stream_id, ChangeEvent, ChangeOp, Lsn, ReplicationEvent, DEFAULT_SCHEMA};
pub use state::{PersistentState, TableMode, TableState};
pub use value::ColumnValue;

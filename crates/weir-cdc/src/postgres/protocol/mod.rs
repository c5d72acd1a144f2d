//! Replication wire protocol
//!
//! - **client**: the replication-mode session (startup, authentication,
//!   CopyBoth framing, standby status updates)
//! - **scram**: SCRAM-SHA-256 authentication exchange
//! - **pgoutput**: decoding of logical replication messages

mod client;
mod pgoutput;
mod scram;

pub use client::{ReplicationClient, ReplicationSocket};
pub use pgoutput::{
    decode_message, BeginMessage, ColumnDescription, CommitMessage, DeleteMessage, InsertMessage,
    LogicalMessage, RelationMessage, TruncateMessage, TupleData, TupleValue, UpdateMessage,
    WireError,
};
pub use scram::{ScramError, ScramExchange};

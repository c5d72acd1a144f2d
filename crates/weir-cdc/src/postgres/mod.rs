//! PostgreSQL capture implementation
//!
//! # Modules
//!
//! - **config**: connector configuration
//! - **protocol**: replication session and pgoutput decoding
//! - **replication**: the stream-reader task and its event channel
//! - **source**: scan-side database access behind the [`SourceDb`] seam
//! - **capture**: the interleaver and the `check`/`discover`/`read` handlers
//!
//! # Architecture
//!
//! ```text
//! PostgreSQL WAL ──> ReplicationStream ──> bounded event channel ─┐
//!                                                                 ├─> Capture ──> MessageOutput
//! PostgreSQL tables ──> PostgresDb (watermarks + chunk scans) ────┘
//! ```

mod capture;
mod config;
pub mod protocol;
mod replication;
mod source;

pub use capture::{check, discover, read, Capture};
pub use config::{Config, ConfigBuilder, DEFAULT_CHUNK_SIZE};
pub use replication::{LsnAck, ReplicationStream, EVENT_CHANNEL_CAPACITY};
pub use source::{PostgresDb, SourceDb, TableInfo};

//! # weir-connect - Connector protocol surface
//!
//! Shared vocabulary between a weir source connector and the harness that
//! drives it:
//!
//! - [`Catalog`] / [`ConfiguredCatalog`] - the streams a source offers and the
//!   subset a user selected
//! - [`Message`] - the newline-delimited JSON objects a running capture emits
//!   (records, state checkpoints, diagnostics)
//! - [`MessageOutput`] - the seam a capture writes through, satisfied by a
//!   JSON encoder in production and an in-memory collector in tests
//! - [`CheckResult`] - the outcome of a connectivity check
//!
//! The command-line framing itself (argument parsing, reading config/catalog
//! files, wiring stdout) lives in the harness, not here.

mod catalog;
mod check;
mod message;

pub use catalog::{Catalog, ConfiguredCatalog, ConfiguredStream, Stream, SyncMode};
pub use check::CheckResult;
pub use message::{
    JsonLinesOutput, LogLevel, LogMessage, MemoryOutput, Message, MessageOutput, RecordMessage,
    StateMessage,
};

//! Output messages emitted by a running capture
//!
//! A capture writes one JSON object per line: data records, state
//! checkpoints, and log lines for diagnostics. The [`MessageOutput`] trait is
//! the seam between the capture and whatever consumes those lines - a
//! [`JsonLinesOutput`] over stdout in normal use, a [`MemoryOutput`] in tests.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// A message on the connector's output stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A data record for one stream
    Record(RecordMessage),
    /// A state checkpoint: the full persistent state object
    State(StateMessage),
    /// A diagnostic line
    Log(LogMessage),
}

impl Message {
    /// Build a record message stamped with the current wall-clock time.
    pub fn record(
        stream: impl Into<String>,
        namespace: Option<String>,
        data: serde_json::Value,
    ) -> Self {
        Message::Record(RecordMessage {
            stream: stream.into(),
            namespace,
            emitted_at: chrono::Utc::now().timestamp_millis(),
            data,
        })
    }

    /// Build a state checkpoint message.
    pub fn state(data: serde_json::Value) -> Self {
        Message::State(StateMessage { data })
    }

    /// Build a log message.
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Message::Log(LogMessage {
            level,
            message: message.into(),
        })
    }
}

/// A single data record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMessage {
    /// Stream (table) name
    pub stream: String,
    /// Namespace (schema) name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Emission timestamp, Unix epoch milliseconds
    pub emitted_at: i64,
    /// The record fields
    pub data: serde_json::Value,
}

/// A state checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    /// The serialized persistent state
    pub data: serde_json::Value,
}

/// A diagnostic log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    /// Severity
    pub level: LogLevel,
    /// Message text
    pub message: String,
}

/// Log line severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// The thing a capture writes records and state checkpoints to.
///
/// Emission failures are fatal to the capture: once the consumer stops
/// accepting messages no further state may be checkpointed.
pub trait MessageOutput: Send {
    /// Write one message.
    fn emit(&mut self, message: &Message) -> std::io::Result<()>;
}

/// Writes messages as newline-delimited JSON.
pub struct JsonLinesOutput<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesOutput<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Unwrap the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> MessageOutput for JsonLinesOutput<W> {
    fn emit(&mut self, message: &Message) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Collects messages in memory. Used by tests that assert on the exact
/// sequence of emitted messages.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl MemoryOutput {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().expect("output lock poisoned").clone()
    }
}

impl MessageOutput for MemoryOutput {
    fn emit(&mut self, message: &Message) -> std::io::Result<()> {
        self.messages
            .lock()
            .expect("output lock poisoned")
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_serialization() {
        let msg = Message::Record(RecordMessage {
            stream: "users".to_string(),
            namespace: Some("public".to_string()),
            emitted_at: 1705000000000,
            data: json!({"id": 1, "name": "alice"}),
        });

        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains(r#""type":"record""#));
        assert!(line.contains(r#""stream":"users""#));
        assert!(line.contains(r#""namespace":"public""#));

        let parsed: Message = serde_json::from_str(&line).unwrap();
        match parsed {
            Message::Record(r) => assert_eq!(r.data["name"], "alice"),
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_state_serialization() {
        let msg = Message::state(json!({"current_lsn": "0/1644E30", "streams": {}}));
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains(r#""type":"state""#));
        assert!(line.contains("current_lsn"));
    }

    #[test]
    fn test_log_level_serialization() {
        let line = serde_json::to_string(&Message::log(LogLevel::Warn, "lagging")).unwrap();
        assert!(line.contains(r#""level":"WARN""#));
    }

    #[test]
    fn test_json_lines_output_writes_one_line_per_message() {
        let mut output = JsonLinesOutput::new(Vec::new());
        output.emit(&Message::state(json!({}))).unwrap();
        output
            .emit(&Message::record("t", None, json!({"id": 1})))
            .unwrap();

        let written = String::from_utf8(output.into_inner()).unwrap();
        let lines: Vec<&str> = written.trim_end().split('\n').collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let _: Message = serde_json::from_str(line).unwrap();
        }
    }

    #[test]
    fn test_memory_output_collects() {
        let mut output = MemoryOutput::new();
        output.emit(&Message::state(json!({}))).unwrap();
        assert_eq!(output.messages().len(), 1);
    }
}

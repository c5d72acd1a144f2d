//! Catalog types for describing available streams

use serde::{Deserialize, Serialize};

/// Catalog of available streams from a source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// Available streams
    pub streams: Vec<Stream>,
}

impl Catalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stream to the catalog
    pub fn add_stream(mut self, stream: Stream) -> Self {
        self.streams.push(stream);
        self
    }

    /// Find a stream by name
    pub fn find_stream(&self, name: &str) -> Option<&Stream> {
        self.streams.iter().find(|s| s.name == name)
    }
}

/// A stream represents a collection of records (for weir, a database table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    /// Name of the stream (the table name)
    pub name: String,

    /// Namespace (the schema name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// JSON Schema of the stream's records
    pub json_schema: serde_json::Value,

    /// Supported sync modes for this stream
    pub supported_sync_modes: Vec<SyncMode>,

    /// Whether the cursor is defined by the source (the replication log
    /// position) rather than chosen by the user
    #[serde(default)]
    pub source_defined_cursor: bool,

    /// Primary key fields discovered from the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_defined_primary_key: Option<Vec<Vec<String>>>,
}

impl Stream {
    /// Create a new stream
    pub fn new(name: impl Into<String>, json_schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            json_schema,
            supported_sync_modes: vec![SyncMode::FullRefresh],
            source_defined_cursor: false,
            source_defined_primary_key: None,
        }
    }

    /// Set namespace
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    /// Set supported sync modes
    pub fn sync_modes(mut self, modes: Vec<SyncMode>) -> Self {
        self.supported_sync_modes = modes;
        self
    }

    /// Mark the cursor as source-defined
    pub fn source_defined_cursor(mut self) -> Self {
        self.source_defined_cursor = true;
        self
    }

    /// Set primary key
    pub fn primary_key(mut self, key: Vec<Vec<String>>) -> Self {
        self.source_defined_primary_key = Some(key);
        self
    }
}

/// Sync mode for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Full refresh: re-read all data each sync
    #[default]
    FullRefresh,
    /// Incremental: backfill once, then follow the replication log
    Incremental,
}

/// Configured catalog: the user's selection of streams and sync modes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    /// Configured streams
    pub streams: Vec<ConfiguredStream>,

    /// Whether the capture should keep tailing the replication log after the
    /// backfill completes. When false the connector is expected to shut
    /// itself down once no further progress is being made.
    #[serde(default = "default_tail")]
    pub tail: bool,
}

fn default_tail() -> bool {
    true
}

impl ConfiguredCatalog {
    /// Create an empty configured catalog that tails forever
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            tail: true,
        }
    }

    /// Create from a catalog, selecting all streams with default settings
    pub fn from_catalog(catalog: &Catalog) -> Self {
        Self {
            streams: catalog
                .streams
                .iter()
                .map(ConfiguredStream::from_stream)
                .collect(),
            tail: true,
        }
    }

    /// Add a configured stream
    pub fn add_stream(mut self, stream: ConfiguredStream) -> Self {
        self.streams.push(stream);
        self
    }

    /// Disable tailing (development mode)
    pub fn no_tail(mut self) -> Self {
        self.tail = false;
        self
    }
}

/// A stream configured by the user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredStream {
    /// The stream definition
    pub stream: Stream,

    /// Selected sync mode
    pub sync_mode: SyncMode,

    /// Primary key override. Each element names one column; composite keys
    /// list several. When absent the source-defined key is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<Vec<String>>>,
}

impl ConfiguredStream {
    /// Create from a stream with default settings
    pub fn from_stream(stream: &Stream) -> Self {
        let sync_mode = stream
            .supported_sync_modes
            .first()
            .copied()
            .unwrap_or(SyncMode::FullRefresh);

        Self {
            stream: stream.clone(),
            sync_mode,
            primary_key: None,
        }
    }

    /// Set sync mode
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Override the primary key
    pub fn primary_key(mut self, key: Vec<Vec<String>>) -> Self {
        self.primary_key = Some(key);
        self
    }
}

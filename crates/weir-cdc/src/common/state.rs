//! Persistent capture state
//!
//! The part of a capture that survives restarts: the replication log position
//! to resume from and, per stream, how far its backfill has progressed. The
//! whole object is emitted as a state checkpoint and handed back verbatim on
//! the next run. Only the interleaver mutates it.

use crate::common::error::{CaptureError, Result};
use crate::common::event::{stream_id, Lsn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use weir_connect::{ConfiguredCatalog, SyncMode};

/// Serializable state of the whole capture.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistentState {
    /// The log position from which replication resumes.
    pub current_lsn: Lsn,
    /// Per-stream state, keyed by normalized stream id.
    pub streams: BTreeMap<String, TableState>,
}

/// Capture phase of a single table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableMode {
    /// Being scanned in keyed chunks; replication events are interleaved.
    Backfill,
    /// Backfill finished; replication events are emitted directly.
    Active,
    /// Configured but not captured; events are dropped.
    Ignore,
}

/// Resumable state of one table's capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableState {
    /// Current phase.
    pub mode: TableMode,
    /// Columns ordering the chunked scan. Matches the table's primary key or
    /// the configured override, and never changes once set.
    pub scan_key: Vec<String>,
    /// Encoded key of the highest row backfilled so far. Absent before the
    /// first chunk and again once the table is Active.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "hex_bytes"
    )]
    pub scanned: Option<Vec<u8>>,
}

impl PersistentState {
    /// Stream ids still being backfilled, in sorted order.
    pub fn pending_streams(&self) -> Vec<String> {
        self.streams
            .iter()
            .filter(|(_, table)| table.mode == TableMode::Backfill)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Bring the stream set in line with the configured catalog.
    ///
    /// New streams get a `Backfill` entry (or `Ignore` when their sync mode
    /// is not incremental) keyed by the catalog's primary-key override or the
    /// database's own key. Streams that left the catalog are forgotten. A
    /// key that conflicts with a previously persisted scan key is an error:
    /// changing the key mid-backfill would make the scanned position
    /// meaningless.
    ///
    /// Returns whether anything changed, so the caller can re-checkpoint.
    pub fn reconcile(
        &mut self,
        catalog: &ConfiguredCatalog,
        db_primary_keys: &BTreeMap<String, Vec<String>>,
        default_schema: &str,
    ) -> Result<bool> {
        let mut dirty = false;

        for configured in &catalog.streams {
            let namespace = configured
                .stream
                .namespace
                .as_deref()
                .unwrap_or(default_schema);
            let id = stream_id(namespace, &configured.stream.name);

            let catalog_key = flatten_key(&id, configured.primary_key.as_deref())?;
            let db_key = db_primary_keys.get(&id).cloned().unwrap_or_default();
            if !db_key.is_empty() {
                debug!(stream = %id, key = ?db_key, "queried primary key");
            }

            let key = match catalog_key {
                Some(catalog_key) => {
                    if !db_key.is_empty() && db_key != catalog_key {
                        warn!(
                            stream = %id,
                            catalog_key = ?catalog_key,
                            database_key = ?db_key,
                            "primary key in catalog differs from database table"
                        );
                    }
                    catalog_key
                }
                None => db_key,
            };
            if key.is_empty() {
                return Err(CaptureError::schema(format!(
                    "stream {id:?}: no primary key configured and none found in the database"
                )));
            }

            match self.streams.get(&id) {
                None => {
                    let mode = if configured.sync_mode == SyncMode::Incremental {
                        TableMode::Backfill
                    } else {
                        TableMode::Ignore
                    };
                    self.streams.insert(
                        id,
                        TableState {
                            mode,
                            scan_key: key,
                            scanned: None,
                        },
                    );
                    dirty = true;
                }
                Some(existing) => {
                    if existing.scan_key != key {
                        return Err(CaptureError::schema(format!(
                            "stream {id:?}: key {:?} doesn't match initialized scan key {:?}",
                            key, existing.scan_key
                        )));
                    }
                }
            }
        }

        let configured_ids: Vec<String> = catalog
            .streams
            .iter()
            .map(|c| {
                let namespace = c.stream.namespace.as_deref().unwrap_or(default_schema);
                stream_id(namespace, &c.stream.name)
            })
            .collect();
        let removed: Vec<String> = self
            .streams
            .keys()
            .filter(|id| !configured_ids.contains(id))
            .cloned()
            .collect();
        for id in removed {
            info!(stream = %id, "stream removed from catalog");
            self.streams.remove(&id);
            dirty = true;
        }

        Ok(dirty)
    }
}

/// The catalog represents a primary key as a list of single-column paths;
/// collapse it into a plain column list.
fn flatten_key(stream: &str, key: Option<&[Vec<String>]>) -> Result<Option<Vec<String>>> {
    let key = match key {
        Some(key) if !key.is_empty() => key,
        _ => return Ok(None),
    };
    let mut columns = Vec::with_capacity(key.len());
    for path in key {
        match path.as_slice() {
            [column] => columns.push(column.clone()),
            other => {
                return Err(CaptureError::schema(format!(
                    "stream {stream:?}: primary key element {other:?} must name exactly one column"
                )));
            }
        }
    }
    Ok(Some(columns))
}

/// Serialize optional binary keys as hex strings so state checkpoints stay
/// readable JSON.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        text.map(|t| hex::decode(t).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weir_connect::{ConfiguredStream, Stream};

    fn configured(namespace: &str, name: &str, mode: SyncMode) -> ConfiguredStream {
        ConfiguredStream::from_stream(
            &Stream::new(name, json!({"type": "object"}))
                .namespace(namespace)
                .sync_modes(vec![mode]),
        )
    }

    fn db_keys(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(id, cols)| {
                (
                    id.to_string(),
                    cols.iter().map(|c| c.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_reconcile_initializes_new_streams() {
        let mut state = PersistentState::default();
        let catalog = ConfiguredCatalog::new()
            .add_stream(configured("public", "users", SyncMode::Incremental));
        let keys = db_keys(&[("public.users", &["id"])]);

        let dirty = state.reconcile(&catalog, &keys, "public").unwrap();
        assert!(dirty);
        let table = &state.streams["public.users"];
        assert_eq!(table.mode, TableMode::Backfill);
        assert_eq!(table.scan_key, vec!["id"]);
        assert!(table.scanned.is_none());
        assert_eq!(state.pending_streams(), vec!["public.users"]);
    }

    #[test]
    fn test_reconcile_marks_full_refresh_streams_ignore() {
        let mut state = PersistentState::default();
        let catalog = ConfiguredCatalog::new()
            .add_stream(configured("public", "audit", SyncMode::FullRefresh));
        let keys = db_keys(&[("public.audit", &["id"])]);

        state.reconcile(&catalog, &keys, "public").unwrap();
        assert_eq!(state.streams["public.audit"].mode, TableMode::Ignore);
        assert!(state.pending_streams().is_empty());
    }

    #[test]
    fn test_reconcile_removes_departed_streams() {
        let mut state = PersistentState::default();
        state.streams.insert(
            "public.old".to_string(),
            TableState {
                mode: TableMode::Active,
                scan_key: vec!["id".to_string()],
                scanned: None,
            },
        );
        let catalog = ConfiguredCatalog::new()
            .add_stream(configured("public", "users", SyncMode::Incremental));
        let keys = db_keys(&[("public.users", &["id"])]);

        let dirty = state.reconcile(&catalog, &keys, "public").unwrap();
        assert!(dirty);
        assert!(!state.streams.contains_key("public.old"));
        assert!(state.streams.contains_key("public.users"));
    }

    #[test]
    fn test_reconcile_unchanged_is_clean() {
        let mut state = PersistentState::default();
        let catalog = ConfiguredCatalog::new()
            .add_stream(configured("public", "users", SyncMode::Incremental));
        let keys = db_keys(&[("public.users", &["id"])]);

        assert!(state.reconcile(&catalog, &keys, "public").unwrap());
        assert!(!state.reconcile(&catalog, &keys, "public").unwrap());
    }

    #[test]
    fn test_reconcile_catalog_key_overrides_database() {
        let mut state = PersistentState::default();
        let catalog = ConfiguredCatalog::new().add_stream(
            configured("public", "users", SyncMode::Incremental)
                .primary_key(vec![vec!["tenant".to_string()], vec!["id".to_string()]]),
        );
        let keys = db_keys(&[("public.users", &["id"])]);

        state.reconcile(&catalog, &keys, "public").unwrap();
        assert_eq!(state.streams["public.users"].scan_key, vec!["tenant", "id"]);
    }

    #[test]
    fn test_reconcile_key_conflict_fails() {
        let mut state = PersistentState::default();
        state.streams.insert(
            "public.users".to_string(),
            TableState {
                mode: TableMode::Backfill,
                scan_key: vec!["id".to_string()],
                scanned: Some(vec![0x01]),
            },
        );
        let catalog = ConfiguredCatalog::new().add_stream(
            configured("public", "users", SyncMode::Incremental)
                .primary_key(vec![vec!["other".to_string()]]),
        );
        let keys = db_keys(&[("public.users", &["id"])]);

        let err = state.reconcile(&catalog, &keys, "public").unwrap_err();
        assert!(err.to_string().contains("doesn't match initialized scan key"));
    }

    #[test]
    fn test_reconcile_requires_some_key() {
        let mut state = PersistentState::default();
        let catalog = ConfiguredCatalog::new()
            .add_stream(configured("public", "keyless", SyncMode::Incremental));

        let err = state
            .reconcile(&catalog, &BTreeMap::new(), "public")
            .unwrap_err();
        assert!(err.to_string().contains("no primary key"));
    }

    #[test]
    fn test_reconcile_rejects_nested_key_paths() {
        let mut state = PersistentState::default();
        let catalog = ConfiguredCatalog::new().add_stream(
            configured("public", "users", SyncMode::Incremental)
                .primary_key(vec![vec!["a".to_string(), "b".to_string()]]),
        );
        let keys = db_keys(&[("public.users", &["id"])]);

        let err = state.reconcile(&catalog, &keys, "public").unwrap_err();
        assert!(err.to_string().contains("exactly one column"));
    }

    #[test]
    fn test_state_roundtrips_through_json() {
        let mut state = PersistentState {
            current_lsn: Lsn(0x16B374D848),
            streams: BTreeMap::new(),
        };
        state.streams.insert(
            "public.users".to_string(),
            TableState {
                mode: TableMode::Backfill,
                scan_key: vec!["id".to_string()],
                scanned: Some(vec![0x10, 0x80, 0x00]),
            },
        );

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["current_lsn"], "16/B374D848");
        assert_eq!(json["streams"]["public.users"]["scanned"], "108000");

        let back: PersistentState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_active_state_omits_scanned() {
        let mut state = PersistentState::default();
        state.streams.insert(
            "public.users".to_string(),
            TableState {
                mode: TableMode::Active,
                scan_key: vec!["id".to_string()],
                scanned: None,
            },
        );
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("scanned"));
    }
}

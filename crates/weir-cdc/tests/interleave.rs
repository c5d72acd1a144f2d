//! End-to-end interleaving scenarios
//!
//! Drives the capture state machine against an in-memory source database and
//! a scripted replication channel, asserting on the exact sequence of
//! emitted messages. The fake writes its watermark transactions onto the
//! replication channel itself, which is exactly the co-replication property
//! the real watermarks table provides.

use std::collections::BTreeMap;
use std::sync::{Mutex, Once};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use weir_cdc::common::rowkey::{encode_row_key, encode_tuple};
use weir_cdc::postgres::{Capture, Config, SourceDb};
use weir_cdc::{
    CaptureError, ChangeEvent, ChangeOp, ColumnValue, Lsn, PersistentState, ReplicationEvent,
    Result,
};
use weir_connect::{
    ConfiguredCatalog, ConfiguredStream, MemoryOutput, Message, Stream, SyncMode,
};

const WATERMARKS_STREAM: &str = "public.watermarks";

static INIT: Once = Once::new();

fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// One scripted write, applied to the fake tables and echoed onto the
/// replication channel in its own transaction.
#[derive(Clone)]
struct Action {
    op: ChangeOp,
    stream: String,
    fields: BTreeMap<String, ColumnValue>,
}

type Rows = BTreeMap<Vec<u8>, BTreeMap<String, ColumnValue>>;

struct Inner {
    tables: BTreeMap<String, Rows>,
    keys: BTreeMap<String, Vec<String>>,
    /// Writes performed right after the n-th watermark write (1-based), i.e.
    /// between that watermark and the scan that follows it.
    actions: BTreeMap<usize, Vec<Action>>,
    watermark_count: usize,
    lsn: u64,
}

struct FakeDb {
    inner: Mutex<Inner>,
    tx: mpsc::Sender<Result<ReplicationEvent>>,
}

impl FakeDb {
    fn new(tx: mpsc::Sender<Result<ReplicationEvent>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tables: BTreeMap::new(),
                keys: BTreeMap::new(),
                actions: BTreeMap::new(),
                watermark_count: 0,
                lsn: 1000,
            }),
            tx,
        }
    }

    fn with_table(self, stream: &str, key: &[&str], rows: Vec<BTreeMap<String, ColumnValue>>) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            let key: Vec<String> = key.iter().map(|c| c.to_string()).collect();
            let mut table = Rows::new();
            for fields in rows {
                let encoded = encode_row_key(&key, &fields).unwrap();
                table.insert(encoded, fields);
            }
            inner.keys.insert(stream.to_string(), key);
            inner.tables.insert(stream.to_string(), table);
        }
        self
    }

    fn after_watermark(self, n: usize, actions: Vec<Action>) -> Self {
        self.inner.lock().unwrap().actions.insert(n, actions);
        self
    }
}

fn split_stream(stream: &str) -> (String, String) {
    let (namespace, table) = stream.split_once('.').unwrap();
    (namespace.to_string(), table.to_string())
}

#[async_trait]
impl SourceDb for FakeDb {
    async fn primary_keys(&self) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self.inner.lock().unwrap().keys.clone())
    }

    async fn write_watermark(&self, slot: &str) -> Result<String> {
        // Build every transaction under the lock, send after releasing it.
        let (watermark, transactions) = {
            let mut inner = self.inner.lock().unwrap();
            inner.watermark_count += 1;
            let watermark = format!("watermark-{}", inner.watermark_count);

            let mut fields = BTreeMap::new();
            fields.insert("slot".to_string(), ColumnValue::from(slot));
            fields.insert("watermark".to_string(), ColumnValue::from(watermark.clone()));
            let mut transactions = vec![Action {
                op: ChangeOp::Insert,
                stream: WATERMARKS_STREAM.to_string(),
                fields,
            }];

            let watermark_count = inner.watermark_count;
            if let Some(actions) = inner.actions.remove(&watermark_count) {
                for action in &actions {
                    let key_columns = inner.keys[&action.stream].clone();
                    let encoded = encode_row_key(&key_columns, &action.fields)?;
                    let table = inner.tables.get_mut(&action.stream).expect("unknown table");
                    match action.op {
                        ChangeOp::Insert | ChangeOp::Update => {
                            table.insert(encoded, action.fields.clone());
                        }
                        ChangeOp::Delete => {
                            table.remove(&encoded);
                        }
                    }
                }
                transactions.extend(actions);
            }

            (watermark, transactions)
        };

        for action in transactions {
            let lsn = {
                let mut inner = self.inner.lock().unwrap();
                inner.lsn += 10;
                inner.lsn
            };
            let (namespace, table) = split_stream(&action.stream);
            let events = vec![
                ReplicationEvent::Begin { lsn: Lsn(lsn) },
                ReplicationEvent::Change(ChangeEvent {
                    op: action.op,
                    namespace,
                    table,
                    fields: action.fields,
                    lsn: Lsn(lsn),
                }),
                ReplicationEvent::Commit { lsn: Lsn(lsn + 1) },
            ];
            for event in events {
                self.tx
                    .send(Ok(event))
                    .await
                    .map_err(|_| CaptureError::replication("test channel closed"))?;
            }
        }
        Ok(watermark)
    }

    async fn scan_chunk(
        &self,
        stream_id: &str,
        _key_columns: &[String],
        resume: Option<&[u8]>,
        chunk_size: usize,
    ) -> Result<Vec<ChangeEvent>> {
        let inner = self.inner.lock().unwrap();
        let table = inner.tables.get(stream_id).ok_or_else(|| {
            CaptureError::invalid_state(format!("scan of unknown stream {stream_id:?}"))
        })?;
        let (namespace, name) = split_stream(stream_id);

        Ok(table
            .iter()
            .filter(|(key, _)| match resume {
                Some(resume) => key.as_slice() > resume,
                None => true,
            })
            .take(chunk_size)
            .map(|(_, fields)| ChangeEvent {
                op: ChangeOp::Insert,
                namespace: namespace.clone(),
                table: name.clone(),
                fields: fields.clone(),
                lsn: Lsn(0),
            })
            .collect())
    }
}

fn row(id: i64, v: &str) -> BTreeMap<String, ColumnValue> {
    let mut fields = BTreeMap::new();
    fields.insert("id".to_string(), ColumnValue::Int(id));
    fields.insert("v".to_string(), ColumnValue::from(v));
    fields
}

fn insert(stream: &str, id: i64, v: &str) -> Action {
    Action {
        op: ChangeOp::Insert,
        stream: stream.to_string(),
        fields: row(id, v),
    }
}

fn update(stream: &str, id: i64, v: &str) -> Action {
    Action {
        op: ChangeOp::Update,
        stream: stream.to_string(),
        fields: row(id, v),
    }
}

fn delete(stream: &str, id: i64, v: &str) -> Action {
    Action {
        op: ChangeOp::Delete,
        stream: stream.to_string(),
        fields: row(id, v),
    }
}

fn test_config(chunk_size: usize) -> Config {
    Config::builder()
        .connection_uri("postgresql://capture@localhost/test")
        .slot_name("test_slot")
        .publication_name("test_pub")
        .watermarks_table(WATERMARKS_STREAM)
        .chunk_size(chunk_size)
        .poll_timeout_seconds(0.4)
        .build()
        .unwrap()
}

fn catalog_for(streams: &[&str]) -> ConfiguredCatalog {
    let mut catalog = ConfiguredCatalog::new().no_tail();
    for stream in streams {
        let (namespace, name) = split_stream(stream);
        catalog = catalog.add_stream(
            ConfiguredStream::from_stream(
                &Stream::new(name, json!({"type": "object"}))
                    .namespace(namespace)
                    .sync_modes(vec![SyncMode::Incremental]),
            ),
        );
    }
    catalog
}

async fn run_capture(
    config: &Config,
    catalog: &ConfiguredCatalog,
    state: &mut PersistentState,
    db: &FakeDb,
    events: mpsc::Receiver<Result<ReplicationEvent>>,
) -> Vec<Message> {
    init_test_logging();
    let mut output = MemoryOutput::new();
    let collected = output.clone();
    Capture::new(config, catalog, state, db, events, &mut output)
        .run()
        .await
        .unwrap();
    collected.messages()
}

fn kinds(messages: &[Message]) -> Vec<&'static str> {
    messages
        .iter()
        .map(|m| match m {
            Message::Record(_) => "record",
            Message::State(_) => "state",
            Message::Log(_) => "log",
        })
        .collect()
}

fn record(message: &Message) -> &serde_json::Value {
    match message {
        Message::Record(r) => &r.data,
        other => panic!("expected record, got {other:?}"),
    }
}

fn state(message: &Message) -> &serde_json::Value {
    match message {
        Message::State(s) => &s.data,
        other => panic!("expected state, got {other:?}"),
    }
}

fn scanned_hex(id: i64) -> String {
    hex::encode(encode_tuple(&[ColumnValue::Int(id)]).unwrap())
}

/// Empty table: two checkpoints bracket an empty backfill, then a live
/// insert streams through with a checkpoint on its commit.
#[tokio::test]
async fn empty_table_then_live_insert() {
    let (tx, rx) = mpsc::channel(256);
    let db = FakeDb::new(tx)
        .with_table("public.t", &["id"], vec![])
        .after_watermark(2, vec![insert("public.t", 1, "a")]);
    let config = test_config(2);
    let catalog = catalog_for(&["public.t"]);
    let mut pstate = PersistentState::default();

    let messages = run_capture(&config, &catalog, &mut pstate, &db, rx).await;

    assert_eq!(kinds(&messages), vec!["state", "state", "record", "state"]);
    assert_eq!(
        state(&messages[0])["streams"]["public.t"]["mode"],
        "Backfill"
    );
    let active = state(&messages[1]);
    assert_eq!(active["streams"]["public.t"]["mode"], "Active");
    assert!(active["streams"]["public.t"].get("scanned").is_none());

    let data = record(&messages[2]);
    assert_eq!(data["id"], 1);
    assert_eq!(data["v"], "a");
    assert_eq!(data["_change_type"], "Insert");

    // The commit checkpoint advanced past the one that closed the backfill.
    let before: Lsn = active["current_lsn"].as_str().unwrap().parse().unwrap();
    let after: Lsn = state(&messages[3])["current_lsn"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(after > before);
}

/// Pure backfill with keys [1,2,3] and chunk size 2: two chunks, a resume
/// checkpoint after the first, activation after the second.
#[tokio::test]
async fn pure_backfill_chunks() {
    let (tx, rx) = mpsc::channel(256);
    let db = FakeDb::new(tx).with_table(
        "public.t",
        &["id"],
        vec![row(1, "a"), row(2, "b"), row(3, "c")],
    );
    let config = test_config(2);
    let catalog = catalog_for(&["public.t"]);
    let mut pstate = PersistentState::default();

    let messages = run_capture(&config, &catalog, &mut pstate, &db, rx).await;

    assert_eq!(
        kinds(&messages),
        vec!["state", "record", "record", "state", "record", "state"]
    );
    assert_eq!(record(&messages[1])["id"], 1);
    assert_eq!(record(&messages[2])["id"], 2);
    let mid = state(&messages[3]);
    assert_eq!(mid["streams"]["public.t"]["mode"], "Backfill");
    assert_eq!(mid["streams"]["public.t"]["scanned"], scanned_hex(2));
    assert_eq!(record(&messages[4])["id"], 3);
    assert_eq!(state(&messages[5])["streams"]["public.t"]["mode"], "Active");
}

/// Writes racing the first scan: an update to a row inside the first chunk
/// is emitted in its patched form (never the stale snapshot, never twice),
/// and an insert beyond the chunk surfaces when the scan reaches it.
#[tokio::test]
async fn update_and_insert_racing_backfill() {
    let (tx, rx) = mpsc::channel(256);
    let db = FakeDb::new(tx)
        .with_table(
            "public.t",
            &["id"],
            vec![row(1, "a"), row(2, "b"), row(3, "c"), row(4, "d")],
        )
        .after_watermark(
            1,
            vec![update("public.t", 2, "x"), insert("public.t", 5, "y")],
        );
    let config = test_config(2);
    let catalog = catalog_for(&["public.t"]);
    let mut pstate = PersistentState::default();

    let messages = run_capture(&config, &catalog, &mut pstate, &db, rx).await;

    let values: Vec<(i64, String)> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Record(r) => Some((
                r.data["id"].as_i64().unwrap(),
                r.data["v"].as_str().unwrap().to_string(),
            )),
            _ => None,
        })
        .collect();
    assert_eq!(
        values,
        vec![
            (1, "a".to_string()),
            (2, "x".to_string()),
            (3, "c".to_string()),
            (4, "d".to_string()),
            (5, "y".to_string()),
        ]
    );

    // Key 2's stale value never leaks, and its record is emitted exactly once.
    assert_eq!(values.iter().filter(|(id, _)| *id == 2).count(), 1);

    let last = state(messages.last().unwrap());
    assert_eq!(last["streams"]["public.t"]["mode"], "Active");
}

/// A delete racing the scan removes the buffered row entirely: the merged
/// stream never shows the row existing.
#[tokio::test]
async fn delete_racing_backfill() {
    let (tx, rx) = mpsc::channel(256);
    let db = FakeDb::new(tx)
        .with_table(
            "public.t",
            &["id"],
            vec![row(1, "a"), row(2, "b"), row(3, "c")],
        )
        .after_watermark(1, vec![delete("public.t", 2, "b")]);
    let config = test_config(3);
    let catalog = catalog_for(&["public.t"]);
    let mut pstate = PersistentState::default();

    let messages = run_capture(&config, &catalog, &mut pstate, &db, rx).await;

    assert_eq!(kinds(&messages), vec!["state", "record", "record", "state"]);
    assert_eq!(record(&messages[1])["id"], 1);
    assert_eq!(record(&messages[2])["id"], 3);
    assert_eq!(state(&messages[3])["streams"]["public.t"]["mode"], "Active");
    for message in &messages {
        if let Message::Record(r) = message {
            assert_ne!(r.data["id"], 2);
            assert_ne!(r.data["_change_type"], "Delete");
        }
    }
}

/// Removing a stream from the catalog drops its state at startup and its
/// events thereafter.
#[tokio::test]
async fn catalog_removal_forgets_stream() {
    let (tx, rx) = mpsc::channel(256);
    let db = FakeDb::new(tx.clone())
        .with_table("public.a", &["id"], vec![])
        .with_table("public.b", &["id"], vec![]);
    let config = test_config(2);
    let catalog = catalog_for(&["public.a"]);

    let mut pstate = PersistentState::default();
    for id in ["public.a", "public.b"] {
        pstate.streams.insert(
            id.to_string(),
            weir_cdc::TableState {
                mode: weir_cdc::TableMode::Active,
                scan_key: vec!["id".to_string()],
                scanned: None,
            },
        );
    }

    // An already-committed change for the departed stream sits in the log.
    for event in [
        ReplicationEvent::Begin { lsn: Lsn(50) },
        ReplicationEvent::Change(ChangeEvent {
            op: ChangeOp::Insert,
            namespace: "public".to_string(),
            table: "b".to_string(),
            fields: row(9, "ghost"),
            lsn: Lsn(50),
        }),
        ReplicationEvent::Commit { lsn: Lsn(51) },
    ] {
        tx.send(Ok(event)).await.unwrap();
    }

    let messages = run_capture(&config, &catalog, &mut pstate, &db, rx).await;

    assert_eq!(kinds(&messages), vec!["state"]);
    let emitted = state(&messages[0]);
    assert!(emitted["streams"].get("public.a").is_some());
    assert!(emitted["streams"].get("public.b").is_none());
    assert!(!state_contains_record(&messages));
    assert!(!pstate.streams.contains_key("public.b"));
}

fn state_contains_record(messages: &[Message]) -> bool {
    messages.iter().any(|m| matches!(m, Message::Record(_)))
}

/// Restarting from a mid-backfill checkpoint produces exactly the remaining
/// suffix: no overlap with what was emitted, no gap.
#[tokio::test]
async fn restart_mid_backfill_resumes_without_overlap() {
    let rows = vec![row(1, "a"), row(2, "b"), row(3, "c")];
    let config = test_config(2);
    let catalog = catalog_for(&["public.t"]);

    // First run: capture the mid-backfill checkpoint after the first chunk.
    let (tx, rx) = mpsc::channel(256);
    let db = FakeDb::new(tx).with_table("public.t", &["id"], rows.clone());
    let mut pstate = PersistentState::default();
    let first_run = run_capture(&config, &catalog, &mut pstate, &db, rx).await;
    let checkpoint = state(&first_run[3]).clone();
    assert_eq!(checkpoint["streams"]["public.t"]["scanned"], scanned_hex(2));

    // Second run: resume from that checkpoint against the same table.
    let mut resumed: PersistentState = serde_json::from_value(checkpoint).unwrap();
    let (tx, rx) = mpsc::channel(256);
    let db = FakeDb::new(tx).with_table("public.t", &["id"], rows);
    let messages = run_capture(&config, &catalog, &mut resumed, &db, rx).await;

    assert_eq!(kinds(&messages), vec!["record", "state"]);
    assert_eq!(record(&messages[0])["id"], 3);
    assert_eq!(state(&messages[1])["streams"]["public.t"]["mode"], "Active");
}

/// Chunk accounting: k full chunks plus a short one means exactly k+1 scans,
/// visible as k resume checkpoints followed by activation.
#[tokio::test]
async fn chunk_boundary_accounting() {
    let (tx, rx) = mpsc::channel(256);
    let table: Vec<_> = (1..=5).map(|id| row(id, "x")).collect();
    let db = FakeDb::new(tx).with_table("public.t", &["id"], table);
    let config = test_config(2);
    let catalog = catalog_for(&["public.t"]);
    let mut pstate = PersistentState::default();

    let messages = run_capture(&config, &catalog, &mut pstate, &db, rx).await;

    // 5 rows at chunk size 2: chunks [1,2], [3,4], [5]; the last is short.
    assert_eq!(
        kinds(&messages),
        vec![
            "state", "record", "record", "state", "record", "record", "state", "record", "state",
        ]
    );
    assert_eq!(state(&messages[3])["streams"]["public.t"]["scanned"], scanned_hex(2));
    assert_eq!(state(&messages[6])["streams"]["public.t"]["scanned"], scanned_hex(4));
    assert_eq!(state(&messages[8])["streams"]["public.t"]["mode"], "Active");
}

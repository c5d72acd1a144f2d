//! The capture process
//!
//! Implements the three connector operations: `check`, `discover`, and
//! `read`. The read path is the interleaver, which merges chunked backfill
//! scans with the replication stream into one consistent, resumable output:
//!
//! 1. write a watermark UUID into the source database,
//! 2. drain replication events until that watermark's own change event
//!    arrives (events for already-backfilled key ranges are emitted, events
//!    ahead of the scan are patched into the buffered chunk),
//! 3. scan the next chunk of every pending stream,
//! 4. flush the buffers in key order and checkpoint.
//!
//! Once every stream is Active the loop degenerates to plain streaming with
//! a checkpoint on each commit that follows at least one emitted record.

use crate::common::rowkey::encode_row_key;
use crate::common::{
    CaptureError, ChangeEvent, ColumnValue, PersistentState, ReplicationEvent, Result, ResultSet,
    TableMode,
};
use crate::postgres::config::Config;
use crate::postgres::replication::{LsnAck, ReplicationStream};
use crate::postgres::source::{PostgresDb, SourceDb, TableInfo};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use weir_connect::{
    Catalog, CheckResult, ConfiguredCatalog, Message, MessageOutput, Stream, SyncMode,
};

/// Verify connectivity with the configured credentials.
pub async fn check(config: &Config) -> CheckResult {
    if let Err(e) = config.validate() {
        return CheckResult::failure(e.to_string());
    }
    let db = match PostgresDb::connect(config).await {
        Ok(db) => db,
        Err(e) => return CheckResult::failure(e.to_string()),
    };
    match db.client().query_one("SELECT 1", &[]).await {
        Ok(_) => CheckResult::success(),
        Err(e) => CheckResult::failure(e.to_string()),
    }
}

/// List candidate streams. Tables with a primary key advertise incremental
/// sync with a source-defined cursor; the watermarks table is never offered.
pub async fn discover(config: &Config) -> Result<Catalog> {
    config.validate()?;
    let db = PostgresDb::connect(config).await?;
    let watermarks = config.watermarks_stream_id();

    let mut catalog = Catalog::new();
    for table in db.discover_streams().await? {
        if crate::common::stream_id(&table.namespace, &table.name) == watermarks {
            continue;
        }
        catalog = catalog.add_stream(catalog_stream(table));
    }
    Ok(catalog)
}

/// Run the capture until shutdown: backfill every configured stream while
/// interleaving replication, then stream indefinitely.
pub async fn read(
    config: &Config,
    catalog: &ConfiguredCatalog,
    state: &mut PersistentState,
    output: &mut impl MessageOutput,
) -> Result<()> {
    config.validate()?;
    info!(slot = %config.slot_name, publication = %config.publication_name, "starting capture");

    let db = PostgresDb::connect(config).await?;
    let mut replication = ReplicationStream::connect(config, state.current_lsn).await?;
    let events = replication
        .take_receiver()
        .ok_or_else(|| CaptureError::invalid_state("replication receiver already taken"))?;
    let ack = replication.ack_handle();

    let mut capture = Capture::new(config, catalog, state, &db, events, output).with_ack(ack);
    let result = match config.max_lifespan_seconds {
        Some(seconds) => {
            match tokio::time::timeout(Duration::from_secs_f64(seconds), capture.run()).await {
                Ok(result) => result,
                Err(_) => {
                    info!(max_lifespan_seconds = seconds, "maximum lifespan reached");
                    Ok(())
                }
            }
        }
        None => capture.run().await,
    };
    drop(capture);

    replication.close().await;
    result
}

/// Resets whenever a message is emitted; firing means the capture has gone
/// quiet and a non-tailing run should stop.
struct Watchdog {
    timeout: Duration,
    deadline: Instant,
}

impl Watchdog {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    fn reset(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }
}

/// How to handle one replication event during a drain.
enum Route {
    Drop,
    Emit,
    Backfill {
        scan_key: Vec<String>,
        scanned: Option<Vec<u8>>,
    },
}

/// The capture state machine. Generic over the scan-side database and the
/// output so the interleaving logic is testable without a server.
pub struct Capture<'a, D: SourceDb, O: MessageOutput> {
    config: &'a Config,
    catalog: &'a ConfiguredCatalog,
    state: &'a mut PersistentState,
    source: &'a D,
    events: mpsc::Receiver<Result<ReplicationEvent>>,
    output: &'a mut O,
    ack: Option<LsnAck>,
    watchdog: Option<Watchdog>,
    watermarks_stream: String,
    changes_since_checkpoint: usize,
}

impl<'a, D: SourceDb, O: MessageOutput> Capture<'a, D, O> {
    /// Assemble a capture over already-opened connections.
    pub fn new(
        config: &'a Config,
        catalog: &'a ConfiguredCatalog,
        state: &'a mut PersistentState,
        source: &'a D,
        events: mpsc::Receiver<Result<ReplicationEvent>>,
        output: &'a mut O,
    ) -> Self {
        let watchdog = match config.poll_timeout_seconds {
            Some(seconds) if !catalog.tail => {
                Some(Watchdog::new(Duration::from_secs_f64(seconds)))
            }
            _ => None,
        };
        Self {
            watermarks_stream: config.watermarks_stream_id(),
            config,
            catalog,
            state,
            source,
            events,
            output,
            ack: None,
            watchdog,
            changes_since_checkpoint: 0,
        }
    }

    /// Attach the handle for confirming checkpointed positions to the
    /// replication slot.
    pub fn with_ack(mut self, ack: LsnAck) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Run to completion. Watchdog expiry is a clean exit, not an error.
    pub async fn run(&mut self) -> Result<()> {
        let result = async {
            self.update_state().await?;
            self.stream_changes().await
        }
        .await;
        match result {
            Err(CaptureError::Cancelled) => {
                info!(
                    poll_timeout_seconds = ?self.config.poll_timeout_seconds,
                    "no progress within the poll timeout, shutting down"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Reconcile persisted stream state with the configured catalog,
    /// re-checkpointing if anything changed.
    async fn update_state(&mut self) -> Result<()> {
        let keys = self.source.primary_keys().await?;
        let dirty = self
            .state
            .reconcile(self.catalog, &keys, &self.config.default_schema)?;
        if dirty {
            self.emit_state()?;
        }
        Ok(())
    }

    async fn stream_changes(&mut self) -> Result<()> {
        if !self.state.pending_streams().is_empty() {
            let mut results = ResultSet::new();
            let mut watermark = self.source.write_watermark(&self.config.slot_name).await?;
            loop {
                self.stream_to_watermark(&watermark, &mut results).await?;
                self.emit_buffered(&mut results)?;
                let pending = self.state.pending_streams();
                if pending.is_empty() {
                    break;
                }
                results = self.backfill_streams(&pending).await?;
                watermark = self.source.write_watermark(&self.config.slot_name).await?;
            }
        }

        info!("all streams active");
        loop {
            let event = match self.next_event().await? {
                Some(event) => event,
                None => {
                    info!("replication stream ended");
                    return Ok(());
                }
            };
            match event {
                ReplicationEvent::Begin { .. } => {}
                ReplicationEvent::Commit { lsn } => {
                    // Commits that carried nothing emittable do not advance
                    // the checkpoint; re-reading them after a restart is
                    // harmless and keeps checkpoints meaningful.
                    if self.changes_since_checkpoint > 0 {
                        self.state.current_lsn = lsn;
                        self.emit_state()?;
                    }
                }
                ReplicationEvent::Change(event) => {
                    let id = event.stream_id();
                    if self.state.streams.get(&id).map(|t| t.mode) == Some(TableMode::Active) {
                        self.handle_change_event(event)?;
                    } else {
                        debug!(stream = %id, "dropping event for inactive stream");
                    }
                }
            }
        }
    }

    /// Drain replication events until the given watermark's change event and
    /// its enclosing commit have been observed.
    async fn stream_to_watermark(&mut self, watermark: &str, results: &mut ResultSet) -> Result<()> {
        debug!(watermark = %watermark, "draining replication until watermark");
        let mut watermark_reached = false;
        loop {
            let event = self.next_event().await?.ok_or_else(|| {
                CaptureError::replication("replication stream ended while draining to a watermark")
            })?;
            let event = match event {
                ReplicationEvent::Begin { .. } => continue,
                ReplicationEvent::Commit { lsn } => {
                    self.state.current_lsn = lsn;
                    if watermark_reached {
                        return Ok(());
                    }
                    continue;
                }
                ReplicationEvent::Change(event) => event,
            };

            let id = event.stream_id();
            if id == self.watermarks_stream {
                let written = event.fields.get("watermark");
                debug!(expected = %watermark, written = ?written, "watermark write observed");
                if written == Some(&ColumnValue::Text(watermark.to_string())) {
                    watermark_reached = true;
                }
                // Watermark events are fencing machinery, never output.
                continue;
            }

            let route = match self.state.streams.get(&id) {
                None => Route::Drop,
                Some(table) => match table.mode {
                    TableMode::Ignore => Route::Drop,
                    TableMode::Active => Route::Emit,
                    TableMode::Backfill => Route::Backfill {
                        scan_key: table.scan_key.clone(),
                        scanned: table.scanned.clone(),
                    },
                },
            };
            match route {
                Route::Drop => debug!(stream = %id, "ignoring stream"),
                Route::Emit => self.handle_change_event(event)?,
                Route::Backfill { scan_key, scanned } => {
                    // Events at or below the scanned position concern rows
                    // already emitted and stream straight through; the rest
                    // are folded into the buffered chunk (or dropped for a
                    // later scan to pick up).
                    let row_key = encode_row_key(&scan_key, &event.fields)?;
                    let already_backfilled = match &scanned {
                        Some(scanned) => row_key <= *scanned,
                        None => false,
                    };
                    if already_backfilled {
                        self.handle_change_event(event)?;
                    } else {
                        results.patch(&id, event)?;
                    }
                }
            }
        }
    }

    /// Emit buffered chunks in key order, advance per-stream state, and
    /// checkpoint. A drain that buffered nothing checkpoints nothing.
    fn emit_buffered(&mut self, results: &mut ResultSet) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        for id in results.streams() {
            let chunk = results
                .take(&id)
                .ok_or_else(|| CaptureError::invalid_state("buffered stream vanished"))?;
            for event in chunk.events {
                self.handle_change_event(event)?;
            }

            let table = self.state.streams.get_mut(&id).ok_or_else(|| {
                CaptureError::invalid_state(format!("no state for buffered stream {id:?}"))
            })?;
            if chunk.complete {
                info!(stream = %id, "backfill complete");
                table.mode = TableMode::Active;
                table.scanned = None;
            } else {
                table.scanned = chunk.scanned;
            }
        }
        self.emit_state()
    }

    /// Scan the next chunk of every pending stream into a fresh result set.
    async fn backfill_streams(&mut self, pending: &[String]) -> Result<ResultSet> {
        let mut results = ResultSet::new();
        for id in pending {
            let (scan_key, scanned) = {
                let table = self.state.streams.get(id).ok_or_else(|| {
                    CaptureError::invalid_state(format!("no state for pending stream {id:?}"))
                })?;
                (table.scan_key.clone(), table.scanned.clone())
            };
            debug!(stream = %id, resume = ?scanned.as_deref().map(hex::encode), "scanning chunk");
            let events = self
                .source
                .scan_chunk(id, &scan_key, scanned.as_deref(), self.config.chunk_size)
                .await?;
            let complete = events.len() < self.config.chunk_size;
            results.buffer(id.clone(), scan_key, events, complete)?;
        }
        Ok(results)
    }

    /// Translate and emit one change event.
    fn handle_change_event(&mut self, event: ChangeEvent) -> Result<()> {
        let mut data = serde_json::Map::new();
        for (name, value) in event.fields {
            data.insert(name, value.into_json());
        }
        data.insert("_change_type".to_string(), json!(event.op.to_string()));
        self.emit_record(event.namespace, event.table, serde_json::Value::Object(data))
    }

    fn emit_record(&mut self, namespace: String, table: String, data: serde_json::Value) -> Result<()> {
        self.changes_since_checkpoint += 1;
        self.emit(&Message::record(table, Some(namespace), data))
    }

    /// Emit a state checkpoint and confirm its position to the slot. Only
    /// called at consistent points: after a flush, or on a commit boundary.
    fn emit_state(&mut self) -> Result<()> {
        self.changes_since_checkpoint = 0;
        let message = Message::state(serde_json::to_value(&*self.state)?);
        self.emit(&message)?;
        if let Some(ack) = &self.ack {
            ack.confirm(self.state.current_lsn);
        }
        Ok(())
    }

    fn emit(&mut self, message: &Message) -> Result<()> {
        if let Some(watchdog) = &mut self.watchdog {
            watchdog.reset();
        }
        self.output.emit(message).map_err(CaptureError::Emit)
    }

    /// Receive the next replication event, honoring the watchdog deadline.
    async fn next_event(&mut self) -> Result<Option<ReplicationEvent>> {
        let deadline = self.watchdog.as_ref().map(|w| w.deadline);
        let received = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(received) => received,
                Err(_) => return Err(CaptureError::Cancelled),
            },
            None => self.events.recv().await,
        };
        received.transpose()
    }
}

fn catalog_stream(table: TableInfo) -> Stream {
    let mut properties = serde_json::Map::new();
    for (name, data_type) in &table.columns {
        properties.insert(name.clone(), column_schema(data_type));
    }
    let schema = json!({"type": "object", "properties": properties});

    let stream = Stream::new(&table.name, schema).namespace(&table.namespace);
    if table.primary_key.is_empty() {
        stream.sync_modes(vec![SyncMode::FullRefresh])
    } else {
        stream
            .sync_modes(vec![SyncMode::Incremental, SyncMode::FullRefresh])
            .source_defined_cursor()
            .primary_key(table.primary_key.iter().map(|c| vec![c.clone()]).collect())
    }
}

/// Sketch a JSON-schema type for an `information_schema` data type, mirroring
/// what the record translator emits.
fn column_schema(data_type: &str) -> serde_json::Value {
    match data_type {
        "boolean" => json!({"type": "boolean"}),
        "smallint" | "integer" | "bigint" => json!({"type": "integer"}),
        "real" | "double precision" => json!({"type": "number"}),
        // json columns pass through structurally and may hold anything
        "json" | "jsonb" => json!({}),
        // everything else (text, numeric, timestamps, uuid, inet, bytea...)
        // is emitted in a text form
        _ => json!({"type": "string"}),
    }
}

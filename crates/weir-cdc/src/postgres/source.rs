//! Scan-side database access
//!
//! Everything the interleaver asks of the source database outside the
//! replication session, behind the [`SourceDb`] seam: watermark writes,
//! keyed chunk scans, and table discovery. [`PostgresDb`] is the production
//! implementation over a normal driver connection; tests drive the
//! interleaver with an in-memory implementation instead.

use crate::common::rowkey::decode_tuple;
use crate::common::{CaptureError, ChangeEvent, ChangeOp, ColumnValue, Lsn, Result};
use crate::postgres::config::Config;
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio_postgres::types::{IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

/// Schemas never offered for capture.
const SYSTEM_SCHEMAS: &[&str] = &["pg_catalog", "information_schema"];

/// The scan-side operations the interleaver needs from a source database.
#[async_trait]
pub trait SourceDb: Send + Sync {
    /// Primary key columns per stream id, in key order.
    async fn primary_keys(&self) -> Result<BTreeMap<String, Vec<String>>>;

    /// Upsert a fresh watermark UUID for `slot` and return it. The write
    /// lands in the replication log, which is what fences each drain cycle.
    async fn write_watermark(&self, slot: &str) -> Result<String>;

    /// Fetch up to `chunk_size` rows of `stream_id` with scan-key tuples
    /// greater than `resume`, in key order.
    async fn scan_chunk(
        &self,
        stream_id: &str,
        key_columns: &[String],
        resume: Option<&[u8]>,
        chunk_size: usize,
    ) -> Result<Vec<ChangeEvent>>;
}

/// A table offered by `discover`.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub namespace: String,
    pub name: String,
    /// Primary key columns, empty when the table has none
    pub primary_key: Vec<String>,
    /// Column names with their `information_schema` data types
    pub columns: Vec<(String, String)>,
}

/// Scan-side connection to PostgreSQL.
pub struct PostgresDb {
    client: Client,
    watermarks_table: String,
}

impl PostgresDb {
    /// Connect using the configured URI.
    pub async fn connect(config: &Config) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(&config.connection_uri, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "scan connection failed");
            }
        });
        info!("scan connection established");
        Ok(Self {
            client,
            watermarks_table: config.watermarks_table.clone(),
        })
    }

    /// The underlying driver client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// List candidate streams with their key and column metadata.
    pub async fn discover_streams(&self) -> Result<Vec<TableInfo>> {
        let keys = self.primary_keys().await?;

        let tables = self
            .client
            .query(
                "SELECT table_schema, table_name
                 FROM information_schema.tables
                 WHERE table_type = 'BASE TABLE'
                   AND table_schema <> ALL($1)
                 ORDER BY table_schema, table_name",
                &[&SYSTEM_SCHEMAS],
            )
            .await?;

        let columns = self
            .client
            .query(
                "SELECT table_schema, table_name, column_name, data_type
                 FROM information_schema.columns
                 WHERE table_schema <> ALL($1)
                 ORDER BY table_schema, table_name, ordinal_position",
                &[&SYSTEM_SCHEMAS],
            )
            .await?;

        let mut columns_by_table: BTreeMap<(String, String), Vec<(String, String)>> =
            BTreeMap::new();
        for row in &columns {
            columns_by_table
                .entry((row.get(0), row.get(1)))
                .or_default()
                .push((row.get(2), row.get(3)));
        }

        let mut infos = Vec::with_capacity(tables.len());
        for row in &tables {
            let namespace: String = row.get(0);
            let name: String = row.get(1);
            let id = crate::common::stream_id(&namespace, &name);
            infos.push(TableInfo {
                primary_key: keys.get(&id).cloned().unwrap_or_default(),
                columns: columns_by_table
                    .remove(&(namespace.clone(), name.clone()))
                    .unwrap_or_default(),
                namespace,
                name,
            });
        }
        debug!(tables = infos.len(), "discovered tables");
        Ok(infos)
    }
}

#[async_trait]
impl SourceDb for PostgresDb {
    async fn primary_keys(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let rows = self
            .client
            .query(
                "SELECT n.nspname, c.relname, a.attname
                 FROM pg_index i
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
                 WHERE i.indisprimary
                   AND n.nspname <> ALL($1)
                 ORDER BY n.nspname, c.relname, array_position(i.indkey, a.attnum)",
                &[&SYSTEM_SCHEMAS],
            )
            .await?;

        let mut keys: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in &rows {
            let namespace: String = row.get(0);
            let table: String = row.get(1);
            let column: String = row.get(2);
            keys.entry(crate::common::stream_id(&namespace, &table))
                .or_default()
                .push(column);
        }
        Ok(keys)
    }

    async fn write_watermark(&self, slot: &str) -> Result<String> {
        let watermark = Uuid::new_v4().to_string();

        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (slot TEXT PRIMARY KEY, watermark TEXT)",
            self.watermarks_table
        );
        self.client.execute(&create, &[]).await?;

        let upsert = format!(
            "INSERT INTO {} (slot, watermark) VALUES ($1, $2) \
             ON CONFLICT (slot) DO UPDATE SET watermark = $2",
            self.watermarks_table
        );
        self.client.execute(&upsert, &[&slot, &watermark]).await?;

        debug!(watermark = %watermark, "wrote watermark");
        Ok(watermark)
    }

    async fn scan_chunk(
        &self,
        stream_id: &str,
        key_columns: &[String],
        resume: Option<&[u8]>,
        chunk_size: usize,
    ) -> Result<Vec<ChangeEvent>> {
        let (schema, table) = stream_id.split_once('.').ok_or_else(|| {
            CaptureError::invalid_state(format!("stream id {stream_id:?} is not namespace.table"))
        })?;

        let rows = match resume {
            Some(resume) => {
                let values = decode_tuple(resume)?;
                if values.len() != key_columns.len() {
                    return Err(CaptureError::invalid_state(format!(
                        "resume key arity {} does not match scan key {key_columns:?}",
                        values.len()
                    )));
                }
                let query = build_scan_query(false, key_columns, schema, table, chunk_size);
                debug!(stream = %stream_id, query = %query, resume = ?values, "scanning chunk");
                let params: Vec<&(dyn ToSql + Sync)> =
                    values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
                self.client.query(&query, &params).await?
            }
            None => {
                let query = build_scan_query(true, key_columns, schema, table, chunk_size);
                debug!(stream = %stream_id, query = %query, "scanning first chunk");
                self.client.query(&query, &[]).await?
            }
        };

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(ChangeEvent {
                op: ChangeOp::Insert,
                namespace: schema.to_string(),
                table: table.to_string(),
                fields: row_fields(row)?,
                lsn: Lsn(0),
            });
        }
        Ok(events)
    }
}

/// Build a keyed chunk query. Row-constructor comparison makes composite
/// keys advance lexicographically.
fn build_scan_query(
    start: bool,
    key_columns: &[String],
    schema: &str,
    table: &str,
    chunk_size: usize,
) -> String {
    let pkey = key_columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let args = (1..=key_columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut query = format!("SELECT * FROM \"{schema}\".\"{table}\"");
    if !start {
        query.push_str(&format!(" WHERE ({pkey}) > ({args})"));
    }
    query.push_str(&format!(" ORDER BY ({pkey}) LIMIT {chunk_size}"));
    query
}

/// Decode a scanned row into typed fields, consulting each column's driver
/// type.
fn row_fields(row: &Row) -> Result<BTreeMap<String, ColumnValue>> {
    let mut fields = BTreeMap::new();
    for (idx, column) in row.columns().iter().enumerate() {
        fields.insert(column.name().to_string(), row_value(row, idx, column.type_())?);
    }
    Ok(fields)
}

fn row_value(row: &Row, idx: usize, ty: &Type) -> Result<ColumnValue> {
    fn wrap<T>(
        value: std::result::Result<Option<T>, tokio_postgres::Error>,
        f: impl FnOnce(T) -> ColumnValue,
    ) -> Result<ColumnValue> {
        Ok(value?.map(f).unwrap_or(ColumnValue::Null))
    }

    match *ty {
        Type::BOOL => wrap(row.try_get::<_, Option<bool>>(idx), ColumnValue::Bool),
        Type::INT2 => wrap(row.try_get::<_, Option<i16>>(idx), |v| {
            ColumnValue::Int(v as i64)
        }),
        Type::INT4 => wrap(row.try_get::<_, Option<i32>>(idx), |v| {
            ColumnValue::Int(v as i64)
        }),
        Type::INT8 => wrap(row.try_get::<_, Option<i64>>(idx), ColumnValue::Int),
        Type::OID => wrap(row.try_get::<_, Option<u32>>(idx), |v| {
            ColumnValue::Int(v as i64)
        }),
        Type::FLOAT4 => wrap(row.try_get::<_, Option<f32>>(idx), |v| {
            ColumnValue::Float(v as f64)
        }),
        Type::FLOAT8 => wrap(row.try_get::<_, Option<f64>>(idx), ColumnValue::Float),
        Type::NUMERIC => wrap(
            row.try_get::<_, Option<rust_decimal::Decimal>>(idx),
            |v| ColumnValue::Numeric(v.to_string()),
        ),
        Type::CHAR | Type::NAME | Type::TEXT | Type::BPCHAR | Type::VARCHAR => {
            wrap(row.try_get::<_, Option<String>>(idx), ColumnValue::Text)
        }
        Type::BYTEA => wrap(row.try_get::<_, Option<Vec<u8>>>(idx), ColumnValue::Bytes),
        Type::UUID => wrap(row.try_get::<_, Option<Uuid>>(idx), ColumnValue::Uuid),
        Type::INET => wrap(
            row.try_get::<_, Option<cidr::IpInet>>(idx),
            ColumnValue::Inet,
        ),
        Type::CIDR => wrap(
            row.try_get::<_, Option<cidr::IpCidr>>(idx),
            ColumnValue::Cidr,
        ),
        Type::MACADDR => wrap(
            row.try_get::<_, Option<eui48::MacAddress>>(idx),
            ColumnValue::MacAddr,
        ),
        Type::DATE => wrap(
            row.try_get::<_, Option<chrono::NaiveDate>>(idx),
            ColumnValue::Date,
        ),
        Type::TIME => wrap(
            row.try_get::<_, Option<chrono::NaiveTime>>(idx),
            ColumnValue::Time,
        ),
        Type::TIMESTAMP => wrap(
            row.try_get::<_, Option<chrono::NaiveDateTime>>(idx),
            ColumnValue::Timestamp,
        ),
        Type::TIMESTAMPTZ => wrap(
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx),
            ColumnValue::TimestampTz,
        ),
        Type::JSON | Type::JSONB => wrap(
            row.try_get::<_, Option<serde_json::Value>>(idx),
            ColumnValue::Json,
        ),
        ref other => {
            // Last resort: many exotic types still decode as text.
            row.try_get::<_, Option<String>>(idx)
                .map(|v| v.map(ColumnValue::Text).unwrap_or(ColumnValue::Null))
                .map_err(|_| {
                    CaptureError::decode(format!(
                        "column {:?} has unsupported type {other}",
                        row.columns()[idx].name()
                    ))
                })
        }
    }
}

/// Binds decoded resume-key values back into scan queries, downcasting to
/// the parameter type PostgreSQL inferred from the compared column.
impl ToSql for ColumnValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            ColumnValue::Null => Ok(IsNull::Yes),
            ColumnValue::Bool(v) => v.to_sql(ty, out),
            ColumnValue::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::OID => u32::try_from(*v)?.to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            ColumnValue::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            ColumnValue::Numeric(v) => rust_decimal::Decimal::from_str(v)?.to_sql(ty, out),
            ColumnValue::Text(v) => v.to_sql(ty, out),
            ColumnValue::Bytes(v) => v.to_sql(ty, out),
            ColumnValue::Uuid(v) => v.to_sql(ty, out),
            ColumnValue::Inet(v) => v.to_sql(ty, out),
            ColumnValue::Cidr(v) => v.to_sql(ty, out),
            ColumnValue::MacAddr(v) => v.to_sql(ty, out),
            ColumnValue::Date(v) => v.to_sql(ty, out),
            ColumnValue::Time(v) => v.to_sql(ty, out),
            ColumnValue::Timestamp(v) => v.to_sql(ty, out),
            ColumnValue::TimestampTz(v) => v.to_sql(ty, out),
            ColumnValue::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Scan keys are dynamically typed; the variant match above decides.
        true
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

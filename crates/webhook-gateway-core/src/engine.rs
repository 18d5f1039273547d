//! Single-connection handle to the embedded DuckDB engine.
//!
//! The gateway keeps exactly one engine connection, guarded by one mutex.
//! Every statement the system issues acquires that mutex: schema bootstrap,
//! catalog reads, artifact installation, evaluator views, audit writes and
//! admin queries alike. The engine is embedded and analytical: UDF
//! registration and view creation are not safe across sessions, and the
//! per-event SQL runs in microseconds-to-milliseconds, so a single lock is
//! the whole synchronization story.
//!
//! Engine failures carry the underlying message verbatim so operators see
//! the real syntax or binding error.

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use duckdb::types::ValueRef;
use duckdb::Connection;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::GatewayResult;

/// Schema bootstrap, executed on every open. All statements are idempotent.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS webhooks (
    id VARCHAR PRIMARY KEY,
    source_path VARCHAR UNIQUE NOT NULL,
    destination_url VARCHAR NOT NULL,
    transform_query VARCHAR NOT NULL,
    filter_query VARCHAR,
    owner VARCHAR NOT NULL,
    active BOOLEAN NOT NULL DEFAULT true,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS reference_tables (
    id VARCHAR PRIMARY KEY,
    webhook_id VARCHAR NOT NULL,
    table_name VARCHAR NOT NULL,
    physical_table VARCHAR NOT NULL,
    description VARCHAR,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS udfs (
    id VARCHAR PRIMARY KEY,
    webhook_id VARCHAR NOT NULL,
    function_name VARCHAR NOT NULL,
    physical_name VARCHAR NOT NULL,
    source VARCHAR NOT NULL,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_events (
    id VARCHAR PRIMARY KEY,
    timestamp TIMESTAMP NOT NULL,
    source_path VARCHAR NOT NULL,
    payload VARCHAR NOT NULL,
    headers VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS transformed_events (
    id VARCHAR PRIMARY KEY,
    raw_event_id VARCHAR NOT NULL,
    webhook_id VARCHAR NOT NULL,
    timestamp TIMESTAMP NOT NULL,
    transformed_payload VARCHAR NOT NULL,
    destination_url VARCHAR NOT NULL,
    success BOOLEAN NOT NULL,
    response_code INTEGER NOT NULL,
    response_body VARCHAR
);
";

// ============================================================================
// Engine handle
// ============================================================================

/// Shared handle to the embedded engine.
///
/// Cloning is cheap; all clones serialize through the same mutex.
#[derive(Clone)]
pub struct StorageEngine {
    conn: Arc<Mutex<Connection>>,
}

/// Column names plus rows of JSON values, as returned by the ad-hoc query
/// surface and consumed by the evaluator.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl StorageEngine {
    /// Open (or create) the engine database at `path` and bootstrap the
    /// schema. The parent directory is created if missing.
    pub fn open(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GatewayError::engine(format!(
                        "cannot create data directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        info!(path = %path.display(), "opening engine database");
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory engine. Used by tests; state dies with the handle.
    pub fn open_in_memory() -> GatewayResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> GatewayResult<Self> {
        conn.execute_batch(SCHEMA)?;
        debug!("engine schema bootstrapped");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the engine connection.
    ///
    /// This is the only way to reach the connection; the lock is released on
    /// all exit paths when the closure returns.
    pub async fn with_conn<T, F>(&self, f: F) -> GatewayResult<T>
    where
        F: FnOnce(&Connection) -> GatewayResult<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run `f` inside a transaction under the engine mutex, committing on
    /// success and rolling back on error.
    pub async fn with_txn<T, F>(&self, f: F) -> GatewayResult<T>
    where
        F: FnOnce(&Connection) -> GatewayResult<T>,
    {
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN TRANSACTION")?;
            match f(conn) {
                Ok(value) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(value)
                }
                Err(err) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(err)
                }
            }
        })
        .await
    }

    /// Execute a single statement, returning the affected row count.
    pub async fn execute(&self, sql: &str) -> GatewayResult<usize> {
        let sql = sql.to_string();
        self.with_conn(move |conn| Ok(conn.execute(&sql, [])?)).await
    }

    /// Execute a query and return column names plus JSON-mapped rows.
    pub async fn query_json(&self, sql: &str) -> GatewayResult<QueryOutput> {
        let sql = sql.to_string();
        self.with_conn(move |conn| query_json_conn(conn, &sql)).await
    }

    /// Bulk-load a CSV file (header row as schema) into `table_name`,
    /// replacing any previous table of that name.
    pub async fn load_csv_table(&self, table_name: &str, csv_path: &Path) -> GatewayResult<()> {
        let table_name = table_name.to_string();
        let csv_path = csv_path.to_path_buf();
        self.with_conn(move |conn| load_csv_conn(conn, &table_name, &csv_path))
            .await
    }

    /// Reject SQL that does not parse as a SELECT statement.
    ///
    /// This is a parse-level check only: binding is deliberately skipped so
    /// that transforms may reference reference tables and UDFs that are
    /// installed after webhook registration.
    pub async fn check_select_syntax(&self, sql: &str) -> GatewayResult<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| check_select_syntax_conn(conn, &sql))
            .await
    }

    /// Physical tables whose names start with `prefix`.
    pub async fn tables_with_prefix(&self, prefix: &str) -> GatewayResult<Vec<String>> {
        let sql = format!(
            "SELECT table_name FROM information_schema.tables WHERE table_name LIKE '{}%' ORDER BY table_name",
            escape_sql_literal(prefix)
        );
        self.with_conn(move |conn| collect_strings(conn, &sql)).await
    }

    /// Scalar functions (macros) whose names start with `prefix`.
    pub async fn functions_with_prefix(&self, prefix: &str) -> GatewayResult<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT function_name FROM duckdb_functions() \
             WHERE function_type = 'macro' AND function_name LIKE '{}%' ORDER BY function_name",
            escape_sql_literal(prefix)
        );
        self.with_conn(move |conn| collect_strings(conn, &sql)).await
    }
}

// ============================================================================
// Connection-level helpers
// ============================================================================

/// Run a query on an already-locked connection and map the result set to
/// column names plus JSON rows.
pub fn query_json_conn(conn: &Connection, sql: &str) -> GatewayResult<QueryOutput> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;

    // Column metadata is only available once the statement has executed.
    let columns: Vec<String> = rows
        .as_ref()
        .map(|s| s.column_names().iter().map(|c| c.to_string()).collect())
        .unwrap_or_default();

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            record.push(value_ref_to_json(row.get_ref(idx)?));
        }
        out.push(record);
    }

    Ok(QueryOutput { columns, rows: out })
}

/// Parse-check a SELECT statement without binding it.
pub fn check_select_syntax_conn(conn: &Connection, sql: &str) -> GatewayResult<()> {
    let probe = format!(
        "SELECT json_serialize_sql('{}')",
        escape_sql_literal(sql)
    );
    let serialized: String = conn.query_row(&probe, [], |row| row.get(0))?;
    let parsed: serde_json::Value = serde_json::from_str(&serialized)
        .map_err(|e| GatewayError::engine(format!("unreadable parser output: {e}")))?;

    if parsed
        .get("error")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        let message = parsed
            .get("error_message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("SQL could not be parsed");
        return Err(GatewayError::invalid(format!("invalid SQL: {message}")));
    }
    Ok(())
}

/// Bulk-load a CSV file into `table_name` on an already-locked connection,
/// replacing any previous table of that name.
pub fn load_csv_conn(conn: &Connection, table_name: &str, csv_path: &Path) -> GatewayResult<()> {
    let sql = format!(
        "CREATE OR REPLACE TABLE {table_name} AS SELECT * FROM read_csv_auto('{}', header = true)",
        escape_sql_literal(&csv_path.to_string_lossy())
    );
    conn.execute_batch(&sql)?;
    Ok(())
}

/// Drop a physical table if present.
pub fn drop_table_conn(conn: &Connection, table_name: &str) -> GatewayResult<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {table_name}"))?;
    Ok(())
}

/// Drop a scalar function (macro) if present.
pub fn drop_macro_conn(conn: &Connection, function_name: &str) -> GatewayResult<()> {
    conn.execute_batch(&format!("DROP MACRO IF EXISTS {function_name}"))?;
    Ok(())
}

fn collect_strings(conn: &Connection, sql: &str) -> GatewayResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get(0)?);
    }
    Ok(out)
}

/// Escape a string for embedding in a single-quoted SQL literal.
pub fn escape_sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}

// ============================================================================
// Value mapping
// ============================================================================

/// Map one engine value to its JSON counterpart.
///
/// Numbers, booleans, nulls and strings map directly; blobs are base64
/// encoded; dates, times and timestamps become ISO-8601 strings. Nested
/// engine types (lists, structs, intervals) are surfaced as their textual
/// rendering.
fn value_ref_to_json(value: ValueRef<'_>) -> serde_json::Value {
    use serde_json::Value;

    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i),
        ValueRef::SmallInt(i) => Value::from(i),
        ValueRef::Int(i) => Value::from(i),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(v) => Value::from(v),
            Err(_) => Value::String(i.to_string()),
        },
        ValueRef::UTinyInt(i) => Value::from(i),
        ValueRef::USmallInt(i) => Value::from(i),
        ValueRef::UInt(i) => Value::from(i),
        ValueRef::UBigInt(i) => Value::from(i),
        ValueRef::Float(f) => json_float(f64::from(f)),
        ValueRef::Double(f) => json_float(f),
        ValueRef::Decimal(d) => {
            let text = d.to_string();
            match text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                Some(n) => Value::Number(n),
                None => Value::String(text),
            }
        }
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
        ValueRef::Date32(days) => Value::String(date_from_epoch_days(days)),
        ValueRef::Time64(unit, v) => Value::String(time_from_micros(unit.to_micros(v))),
        ValueRef::Timestamp(unit, v) => Value::String(timestamp_from_micros(unit.to_micros(v))),
        other => Value::String(format!("{other:?}")),
    }
}

fn json_float(f: f64) -> serde_json::Value {
    match serde_json::Number::from_f64(f) {
        Some(n) => serde_json::Value::Number(n),
        // NaN and infinities have no JSON representation
        None => serde_json::Value::Null,
    }
}

fn date_from_epoch_days(days: i32) -> String {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .map(|epoch| epoch + chrono::Duration::days(i64::from(days)))
        .map(|d| d.to_string())
        .unwrap_or_else(|| days.to_string())
}

fn time_from_micros(micros: i64) -> String {
    let secs = (micros / 1_000_000) as u32;
    let nanos = ((micros % 1_000_000) * 1_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
        .map(|t| t.to_string())
        .unwrap_or_else(|| micros.to_string())
}

fn timestamp_from_micros(micros: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| micros.to_string())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

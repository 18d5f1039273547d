//! Installer for per-webhook reference tables and scalar UDFs.
//!
//! The installer owns the physical engine objects and their lifecycle; the
//! catalog owns the metadata rows describing them. Physical names embed the
//! owning webhook id so identical logical names under different webhooks
//! never collide:
//!
//! - reference tables: `ref_<webhook id, dashes as underscores>_<name>`
//! - scalar UDFs:      `udf_<webhook id, dashes as underscores>_<name>`
//!
//! Deletion drops the engine object first and removes metadata second, so a
//! mid-operation crash leaves at most an orphan metadata row. Those are
//! swept by [`reconcile`] at startup.

use std::path::Path;

use chrono::Utc;
use duckdb::{params, Connection};
use tracing::{info, warn};

use crate::catalog::{ReferenceTable, ScalarUdf};
use crate::engine::{drop_macro_conn, drop_table_conn, load_csv_conn, StorageEngine};
use crate::error::GatewayError;
use crate::udf;
use crate::{GatewayResult, ReferenceTableId, UdfId, WebhookId};

// ============================================================================
// Naming
// ============================================================================

/// True when `name` is usable as an unquoted identifier: letters, digits and
/// underscores, not starting with a digit.
pub fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Physical table name for a webhook-scoped reference table.
pub fn reference_table_physical_name(webhook_id: WebhookId, logical_name: &str) -> String {
    format!("ref_{}_{}", webhook_id.physical_component(), logical_name)
}

/// Physical function name for a webhook-scoped UDF.
pub fn udf_physical_name(webhook_id: WebhookId, function_name: &str) -> String {
    format!("udf_{}_{}", webhook_id.physical_component(), function_name)
}

fn ensure_safe_identifier(kind: &str, name: &str) -> GatewayResult<()> {
    if is_safe_identifier(name) {
        Ok(())
    } else {
        Err(GatewayError::invalid(format!(
            "{kind} '{name}' is not a valid identifier \
             (letters, digits and underscores, not starting with a digit)"
        )))
    }
}

fn ensure_webhook_exists(conn: &Connection, webhook_id: WebhookId) -> GatewayResult<()> {
    match conn.query_row(
        "SELECT id FROM webhooks WHERE id = ?",
        params![webhook_id.to_string()],
        |row| row.get::<_, String>(0),
    ) {
        Ok(_) => Ok(()),
        Err(duckdb::Error::QueryReturnedNoRows) => {
            Err(GatewayError::not_found("webhook", webhook_id))
        }
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Reference tables
// ============================================================================

/// Load a CSV file (header row as schema) as a reference table for
/// `webhook_id`. Re-uploading the same logical name replaces the table's
/// contents, which is what operators expect from a lookup-table refresh.
pub async fn upload_reference_table(
    engine: &StorageEngine,
    webhook_id: WebhookId,
    table_name: &str,
    description: &str,
    csv_path: &Path,
) -> GatewayResult<ReferenceTable> {
    ensure_safe_identifier("table name", table_name)?;

    let physical = reference_table_physical_name(webhook_id, table_name);
    let csv_path = csv_path.to_path_buf();
    let logical = table_name.to_string();
    let description = description.to_string();
    let row = engine
        .with_txn(move |conn| {
            ensure_webhook_exists(conn, webhook_id)?;

            load_csv_conn(conn, &physical, &csv_path).map_err(|e| {
                GatewayError::invalid(format!("failed to load CSV into '{logical}': {e}"))
            })?;

            let now = Utc::now();
            let existing = match conn.query_row(
                "SELECT id, created_at FROM reference_tables \
                 WHERE webhook_id = ? AND table_name = ?",
                params![webhook_id.to_string(), logical],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, chrono::DateTime<Utc>>(1)?,
                    ))
                },
            ) {
                Ok(found) => Some(found),
                Err(duckdb::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };

            let row = match existing {
                Some((id, created_at)) => {
                    conn.execute(
                        "UPDATE reference_tables SET description = ?, updated_at = ? WHERE id = ?",
                        params![description, now, id],
                    )?;
                    ReferenceTable {
                        id: id.parse()?,
                        webhook_id,
                        table_name: logical.clone(),
                        physical_table: physical.clone(),
                        description: Some(description.clone()),
                        created_at,
                        updated_at: now,
                    }
                }
                None => {
                    let id = ReferenceTableId::new();
                    conn.execute(
                        "INSERT INTO reference_tables \
                         (id, webhook_id, table_name, physical_table, description, created_at, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?, ?)",
                        params![
                            id.to_string(),
                            webhook_id.to_string(),
                            logical,
                            physical,
                            description,
                            now,
                            now,
                        ],
                    )?;
                    ReferenceTable {
                        id,
                        webhook_id,
                        table_name: logical.clone(),
                        physical_table: physical.clone(),
                        description: Some(description.clone()),
                        created_at: now,
                        updated_at: now,
                    }
                }
            };
            Ok(row)
        })
        .await?;

    info!(
        webhook_id = %webhook_id,
        table = %row.physical_table,
        "reference table installed"
    );
    Ok(row)
}

/// Drop a reference table: physical object first, then metadata. A missing
/// physical table is tolerated so the operation is idempotent.
pub async fn delete_reference_table(
    engine: &StorageEngine,
    id: ReferenceTableId,
) -> GatewayResult<()> {
    engine
        .with_txn(move |conn| {
            let physical = match conn.query_row(
                "SELECT physical_table FROM reference_tables WHERE id = ?",
                params![id.to_string()],
                |row| row.get::<_, String>(0),
            ) {
                Ok(name) => name,
                Err(duckdb::Error::QueryReturnedNoRows) => {
                    return Err(GatewayError::not_found("reference table", id))
                }
                Err(e) => return Err(e.into()),
            };

            drop_table_conn(conn, &physical)?;
            conn.execute(
                "DELETE FROM reference_tables WHERE id = ?",
                params![id.to_string()],
            )?;
            info!(table = %physical, "reference table dropped");
            Ok(())
        })
        .await
}

// ============================================================================
// Scalar UDFs
// ============================================================================

/// Compile and install a scalar UDF for `webhook_id` from mini-language
/// source (see [`crate::udf`]).
///
/// The source must define a function named `function_name` at the top level
/// with at least one parameter. Compilation happens once, here; afterwards
/// the engine resolves the stable physical name.
pub async fn register_udf(
    engine: &StorageEngine,
    webhook_id: WebhookId,
    function_name: &str,
    source: &str,
) -> GatewayResult<ScalarUdf> {
    ensure_safe_identifier("function name", function_name)?;

    let defs = udf::parse_source(source)?;
    let def = udf::find_definition(&defs, function_name)?;
    if def.arity() == 0 {
        return Err(GatewayError::invalid(format!(
            "function '{function_name}' must take at least one parameter"
        )));
    }

    let physical = udf_physical_name(webhook_id, function_name);
    let create_sql = def.compile(&physical);
    let probe_sql = def.probe_call(&physical);

    let logical = function_name.to_string();
    let source = source.to_string();
    let row = engine
        .with_txn(move |conn| {
            ensure_webhook_exists(conn, webhook_id)?;

            conn.execute_batch(&create_sql).map_err(|e| {
                GatewayError::invalid(format!("UDF '{logical}' failed to compile: {e}"))
            })?;
            // Bind errors in the body only surface on invocation.
            conn.query_row(&probe_sql, [], |_row| Ok(())).map_err(|e| {
                GatewayError::invalid(format!("UDF '{logical}' failed to compile: {e}"))
            })?;

            let now = Utc::now();
            let existing = match conn.query_row(
                "SELECT id, created_at FROM udfs WHERE webhook_id = ? AND function_name = ?",
                params![webhook_id.to_string(), logical],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, chrono::DateTime<Utc>>(1)?,
                    ))
                },
            ) {
                Ok(found) => Some(found),
                Err(duckdb::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };

            let row = match existing {
                Some((id, created_at)) => {
                    conn.execute(
                        "UPDATE udfs SET source = ?, updated_at = ? WHERE id = ?",
                        params![source, now, id],
                    )?;
                    ScalarUdf {
                        id: id.parse()?,
                        webhook_id,
                        function_name: logical.clone(),
                        physical_name: physical.clone(),
                        source: source.clone(),
                        created_at,
                        updated_at: now,
                    }
                }
                None => {
                    let id = UdfId::new();
                    conn.execute(
                        "INSERT INTO udfs \
                         (id, webhook_id, function_name, physical_name, source, created_at, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?, ?)",
                        params![
                            id.to_string(),
                            webhook_id.to_string(),
                            logical,
                            physical,
                            source,
                            now,
                            now,
                        ],
                    )?;
                    ScalarUdf {
                        id,
                        webhook_id,
                        function_name: logical.clone(),
                        physical_name: physical.clone(),
                        source: source.clone(),
                        created_at: now,
                        updated_at: now,
                    }
                }
            };
            Ok(row)
        })
        .await?;

    info!(
        webhook_id = %webhook_id,
        function = %row.physical_name,
        "scalar UDF installed"
    );
    Ok(row)
}

/// Drop a UDF: engine macro first, then metadata. Idempotent with respect to
/// an already-absent macro.
pub async fn delete_udf(engine: &StorageEngine, id: UdfId) -> GatewayResult<()> {
    engine
        .with_txn(move |conn| {
            let physical = match conn.query_row(
                "SELECT physical_name FROM udfs WHERE id = ?",
                params![id.to_string()],
                |row| row.get::<_, String>(0),
            ) {
                Ok(name) => name,
                Err(duckdb::Error::QueryReturnedNoRows) => {
                    return Err(GatewayError::not_found("UDF", id))
                }
                Err(e) => return Err(e.into()),
            };

            drop_macro_conn(conn, &physical)?;
            conn.execute("DELETE FROM udfs WHERE id = ?", params![id.to_string()])?;
            info!(function = %physical, "scalar UDF dropped");
            Ok(())
        })
        .await
}

// ============================================================================
// Cascade and reconciliation
// ============================================================================

/// Drop every physical artifact belonging to `webhook_id` and remove the
/// matching metadata rows. Engine objects go first so a crash cannot leave
/// a physical object without metadata.
pub async fn drop_webhook_artifacts(
    engine: &StorageEngine,
    webhook_id: WebhookId,
) -> GatewayResult<()> {
    engine
        .with_txn(move |conn| {
            let tables = collect_column(
                conn,
                "SELECT physical_table FROM reference_tables WHERE webhook_id = ?",
                &webhook_id.to_string(),
            )?;
            for table in &tables {
                drop_table_conn(conn, table)?;
            }
            conn.execute(
                "DELETE FROM reference_tables WHERE webhook_id = ?",
                params![webhook_id.to_string()],
            )?;

            let functions = collect_column(
                conn,
                "SELECT physical_name FROM udfs WHERE webhook_id = ?",
                &webhook_id.to_string(),
            )?;
            for function in &functions {
                drop_macro_conn(conn, function)?;
            }
            conn.execute(
                "DELETE FROM udfs WHERE webhook_id = ?",
                params![webhook_id.to_string()],
            )?;

            info!(
                webhook_id = %webhook_id,
                tables = tables.len(),
                functions = functions.len(),
                "webhook artifacts dropped"
            );
            Ok(())
        })
        .await
}

/// Startup sweep: delete metadata rows whose physical table or macro is
/// missing from the engine. Returns the number of rows swept.
pub async fn reconcile(engine: &StorageEngine) -> GatewayResult<usize> {
    engine
        .with_txn(|conn| {
            let mut swept = 0usize;

            let tables: Vec<(String, String)> = {
                let mut stmt =
                    conn.prepare("SELECT id, physical_table FROM reference_tables")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?));
                }
                out
            };
            for (id, physical) in tables {
                let present: i64 = conn.query_row(
                    "SELECT count(*) FROM information_schema.tables WHERE table_name = ?",
                    params![physical],
                    |row| row.get(0),
                )?;
                if present == 0 {
                    warn!(table = %physical, "sweeping orphan reference table metadata");
                    conn.execute("DELETE FROM reference_tables WHERE id = ?", params![id])?;
                    swept += 1;
                }
            }

            let functions: Vec<(String, String)> = {
                let mut stmt = conn.prepare("SELECT id, physical_name FROM udfs")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?));
                }
                out
            };
            for (id, physical) in functions {
                let present: i64 = conn.query_row(
                    "SELECT count(*) FROM duckdb_functions() \
                     WHERE function_type = 'macro' AND function_name = ?",
                    params![physical],
                    |row| row.get(0),
                )?;
                if present == 0 {
                    warn!(function = %physical, "sweeping orphan UDF metadata");
                    conn.execute("DELETE FROM udfs WHERE id = ?", params![id])?;
                    swept += 1;
                }
            }

            Ok(swept)
        })
        .await
}

fn collect_column(conn: &Connection, sql: &str, param: &str) -> GatewayResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![param])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get(0)?);
    }
    Ok(out)
}

#[cfg(test)]
#[path = "artifacts_tests.rs"]
mod tests;

//! Per-event transform/filter evaluation.
//!
//! Each event gets an ephemeral single-row view with one `payload` column
//! holding the event JSON. The operator's SQL reaches the payload by naming
//! the `{{payload}}` token, which is substituted with the view name; JSON
//! values inside the payload are reached through the engine's JSON path
//! functions in the operator's own SQL.
//!
//! The whole sequence (create view, filter, transform, drop view) runs
//! under a single acquisition of the engine mutex, and the view is dropped
//! on all exit paths.

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::catalog::Webhook;
use crate::engine::{escape_sql_literal, query_json_conn, QueryOutput, StorageEngine};
use crate::error::GatewayError;
use crate::GatewayResult;

/// Outcome of evaluating one event against a webhook's filter and transform.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The filter rejected the event; nothing is forwarded.
    Filtered,
    /// The transformed payload to forward: a single object for one result
    /// row, an array of objects for several.
    Transformed(Value),
}

/// Evaluate `payload` against the webhook's filter and transform.
///
/// Filter semantics: `SELECT (<filter>) FROM <view>` must produce a single
/// boolean; NULL counts as false. SQL failures in either fragment are
/// reported as [`GatewayError::Evaluation`].
pub async fn evaluate(
    engine: &StorageEngine,
    webhook: &Webhook,
    payload: &Value,
) -> GatewayResult<Evaluation> {
    let view = ephemeral_view_name();
    let payload_text = payload.to_string();
    let filter = webhook.filter_query.clone();
    let transform = webhook.transform_query.clone();

    engine
        .with_conn(move |conn| {
            let create = format!(
                "CREATE OR REPLACE TEMPORARY VIEW {view} AS \
                 SELECT CAST('{}' AS JSON) AS payload",
                escape_sql_literal(&payload_text)
            );
            conn.execute_batch(&create)?;

            let result = run_event_queries(conn, &view, filter.as_deref(), &transform);

            // The view must not outlive the event, whatever happened above.
            let _ = conn.execute_batch(&format!("DROP VIEW IF EXISTS {view}"));

            result
        })
        .await
}

fn run_event_queries(
    conn: &duckdb::Connection,
    view: &str,
    filter: Option<&str>,
    transform: &str,
) -> GatewayResult<Evaluation> {
    if let Some(filter) = filter {
        let sql = format!("SELECT ({}) FROM {view}", substitute_payload_token(filter, view));
        let passed: Option<bool> = conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| GatewayError::evaluation(e.to_string()))?;
        if !passed.unwrap_or(false) {
            debug!(view, "event rejected by filter");
            return Ok(Evaluation::Filtered);
        }
    }

    let sql = substitute_payload_token(transform, view);
    let output = query_json_conn(conn, &sql).map_err(|e| match e {
        GatewayError::Engine { message } => GatewayError::evaluation(message),
        other => other,
    })?;

    Ok(Evaluation::Transformed(shape_result(output)))
}

/// Shape a result set into the outgoing payload: result columns become the
/// object keys; one row yields a flat object, several yield an array of
/// row objects, none yields an empty object.
fn shape_result(output: QueryOutput) -> Value {
    let QueryOutput { columns, mut rows } = output;
    match rows.len() {
        0 => Value::Object(Map::new()),
        1 => row_object(&columns, rows.remove(0)),
        _ => Value::Array(
            rows.into_iter()
                .map(|row| row_object(&columns, row))
                .collect(),
        ),
    }
}

fn row_object(columns: &[String], row: Vec<Value>) -> Value {
    let mut object = Map::with_capacity(columns.len());
    for (column, value) in columns.iter().zip(row) {
        object.insert(column.clone(), value);
    }
    Value::Object(object)
}

fn ephemeral_view_name() -> String {
    format!("payload_{}", Uuid::new_v4().simple())
}

// ============================================================================
// Token substitution
// ============================================================================

/// Replace every `{{payload}}` token (whitespace inside the braces is
/// tolerated) with `replacement`. The substitution is purely textual.
pub fn substitute_payload_token(template: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) if after[..end].trim() == "payload" => {
                out.push_str(&rest[..start]);
                out.push_str(replacement);
                rest = &after[end + 2..];
            }
            _ => {
                out.push_str(&rest[..start + 2]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// True when the template contains at least one `{{payload}}` token.
pub fn contains_payload_token(template: &str) -> bool {
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) if after[..end].trim() == "payload" => return true,
            Some(_) | None => rest = after,
        }
    }
    false
}

#[cfg(test)]
#[path = "evaluator_tests.rs"]
mod tests;

//! Append-only event log.
//!
//! Two tables record the life of every event: `raw_events` captures ingress
//! exactly as received (path, payload, headers), committed before any
//! evaluation; `transformed_events` captures the outcome of each dispatch
//! attempt, committed after it completes. Rows are never updated or
//! deleted; webhook deletion leaves history in place.

use chrono::{DateTime, Utc};
use duckdb::params;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::engine::StorageEngine;
use crate::error::GatewayError;
use crate::{GatewayResult, RawEventId, WebhookId};

/// Writer and query surface over the event tables.
#[derive(Clone)]
pub struct EventLog {
    engine: StorageEngine,
}

/// Everything recorded about one dispatch attempt.
#[derive(Debug, Clone)]
pub struct TransformedEventRecord {
    pub raw_event_id: RawEventId,
    pub webhook_id: WebhookId,
    pub destination_url: String,
    pub transformed_payload: Value,
    pub success: bool,
    pub response_code: i32,
    pub response_body: Option<String>,
}

/// One line of the recent-events listing.
#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_path: String,
    pub success: Option<bool>,
    pub response_code: Option<i32>,
}

/// Full detail for one event: the raw record plus the dispatch outcome,
/// when one exists.
#[derive(Debug, Clone, Serialize)]
pub struct EventDetail {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_path: String,
    pub raw_payload: Value,
    pub headers: Value,
    pub transformed: Option<TransformedDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformedDetail {
    pub id: String,
    pub webhook_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub destination_url: String,
    pub success: bool,
    pub response_code: i32,
    pub response_body: Option<String>,
}

/// Gateway-wide counters and the per-webhook success-rate rollup.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub webhook_count: i64,
    pub raw_event_count: i64,
    pub transformed_event_count: i64,
    pub webhook_success_rates: Vec<WebhookSuccessRate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookSuccessRate {
    pub webhook_id: String,
    pub total_events: i64,
    pub success_count: i64,
    pub success_rate: f64,
}

impl EventLog {
    pub fn new(engine: StorageEngine) -> Self {
        Self { engine }
    }

    /// Record a raw ingress event. This commit happens before the evaluator
    /// runs, so an accepted event survives a crash of anything downstream.
    pub async fn record_raw_event(
        &self,
        source_path: &str,
        payload: &Value,
        headers: &Value,
    ) -> GatewayResult<RawEventId> {
        let id = RawEventId::new();
        let now = Utc::now();
        let source_path = source_path.to_string();
        let payload = payload.to_string();
        let headers = headers.to_string();

        self.engine
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO raw_events (id, timestamp, source_path, payload, headers) \
                     VALUES (?, ?, ?, ?, ?)",
                    params![id.to_string(), now, source_path, payload, headers],
                )?;
                Ok(())
            })
            .await?;

        debug!(event_id = %id, "raw event recorded");
        Ok(id)
    }

    /// Record the outcome of a dispatch attempt (or an evaluation failure).
    /// Exactly one row per attempted delivery.
    pub async fn record_transformed_event(
        &self,
        record: TransformedEventRecord,
    ) -> GatewayResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        self.engine
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO transformed_events \
                     (id, raw_event_id, webhook_id, timestamp, transformed_payload, \
                      destination_url, success, response_code, response_body) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        id.to_string(),
                        record.raw_event_id.to_string(),
                        record.webhook_id.to_string(),
                        now,
                        record.transformed_payload.to_string(),
                        record.destination_url,
                        record.success,
                        record.response_code,
                        record.response_body,
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!(transformed_event_id = %id, "transformed event recorded");
        Ok(id)
    }

    /// The most recent events, newest first, with their dispatch outcome
    /// joined on when present.
    pub async fn recent_events(&self, limit: usize) -> GatewayResult<Vec<EventSummary>> {
        let limit = limit as i64;
        self.engine
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT r.id, r.timestamp, r.source_path, t.success, t.response_code \
                     FROM raw_events r \
                     LEFT JOIN transformed_events t ON r.id = t.raw_event_id \
                     ORDER BY r.timestamp DESC \
                     LIMIT ?",
                )?;
                let mut rows = stmt.query(params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(EventSummary {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        source_path: row.get(2)?,
                        success: row.get(3)?,
                        response_code: row.get(4)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Raw payload plus dispatch outcome for one event.
    pub async fn event_detail(&self, id: RawEventId) -> GatewayResult<EventDetail> {
        self.engine
            .with_conn(move |conn| {
                let raw = match conn.query_row(
                    "SELECT id, timestamp, source_path, payload, headers \
                     FROM raw_events WHERE id = ?",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, DateTime<Utc>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                ) {
                    Ok(raw) => raw,
                    Err(duckdb::Error::QueryReturnedNoRows) => {
                        return Err(GatewayError::not_found("event", id))
                    }
                    Err(e) => return Err(e.into()),
                };

                let transformed = match conn.query_row(
                    "SELECT id, webhook_id, timestamp, transformed_payload, destination_url, \
                     success, response_code, response_body \
                     FROM transformed_events WHERE raw_event_id = ?",
                    params![id.to_string()],
                    |row| {
                        Ok(TransformedDetail {
                            id: row.get(0)?,
                            webhook_id: row.get(1)?,
                            timestamp: row.get(2)?,
                            payload: parse_json_column(row.get::<_, String>(3)?),
                            destination_url: row.get(4)?,
                            success: row.get(5)?,
                            response_code: row.get(6)?,
                            response_body: row.get(7)?,
                        })
                    },
                ) {
                    Ok(detail) => Some(detail),
                    Err(duckdb::Error::QueryReturnedNoRows) => None,
                    Err(e) => return Err(e.into()),
                };

                Ok(EventDetail {
                    id: raw.0,
                    timestamp: raw.1,
                    source_path: raw.2,
                    raw_payload: parse_json_column(raw.3),
                    headers: parse_json_column(raw.4),
                    transformed,
                })
            })
            .await
    }

    /// Counters plus the per-webhook success-rate rollup.
    pub async fn stats(&self) -> GatewayResult<GatewayStats> {
        self.engine
            .with_conn(|conn| {
                let webhook_count: i64 =
                    conn.query_row("SELECT count(*) FROM webhooks", [], |row| row.get(0))?;
                let raw_event_count: i64 =
                    conn.query_row("SELECT count(*) FROM raw_events", [], |row| row.get(0))?;
                let transformed_event_count: i64 = conn.query_row(
                    "SELECT count(*) FROM transformed_events",
                    [],
                    |row| row.get(0),
                )?;

                let mut stmt = conn.prepare(
                    "SELECT webhook_id, \
                            count(*) AS total_events, \
                            CAST(sum(CASE WHEN success THEN 1 ELSE 0 END) AS BIGINT) AS success_count, \
                            CAST(sum(CASE WHEN success THEN 1 ELSE 0 END) AS DOUBLE) / count(*) \
                                AS success_rate \
                     FROM transformed_events \
                     GROUP BY webhook_id \
                     ORDER BY webhook_id",
                )?;
                let mut rows = stmt.query([])?;
                let mut rates = Vec::new();
                while let Some(row) = rows.next()? {
                    rates.push(WebhookSuccessRate {
                        webhook_id: row.get(0)?,
                        total_events: row.get(1)?,
                        success_count: row.get(2)?,
                        success_rate: row.get(3)?,
                    });
                }

                Ok(GatewayStats {
                    webhook_count,
                    raw_event_count,
                    transformed_event_count,
                    webhook_success_rates: rates,
                })
            })
            .await
    }
}

/// Event payload columns are written by us and always hold valid JSON, but
/// a hand-edited database should not make the API explode.
fn parse_json_column(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;

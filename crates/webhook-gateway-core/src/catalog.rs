//! Durable metadata store for webhooks, reference tables and UDFs.
//!
//! The catalog owns the metadata rows; physical tables and functions belong
//! to the installer ([`crate::artifacts`]). Registration performs dry
//! validation of the operator's SQL so invalid configurations never reach
//! persistent state.

use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::engine::StorageEngine;
use crate::error::GatewayError;
use crate::evaluator::{contains_payload_token, substitute_payload_token};
use crate::{GatewayResult, ReferenceTableId, UdfId, WebhookId};

/// Placeholder view name used when dry-validating operator SQL.
const DRY_RUN_VIEW: &str = "__payload";

// ============================================================================
// Rows
// ============================================================================

/// A registered webhook: an ingress path with its transformation,
/// optional filter and destination.
#[derive(Debug, Clone, Serialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub source_path: String,
    pub destination_url: String,
    pub transform_query: String,
    pub filter_query: Option<String>,
    pub owner: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering or updating a webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSpec {
    pub source_path: String,
    pub destination_url: String,
    pub transform_query: String,
    #[serde(default)]
    pub filter_query: Option<String>,
    pub owner: String,
}

impl WebhookSpec {
    /// Normalize and validate the non-SQL parts of the spec.
    fn normalized(mut self) -> GatewayResult<Self> {
        let trimmed = self.source_path.trim();
        if trimmed.is_empty() || trimmed == "/" {
            return Err(GatewayError::invalid("source_path must not be empty"));
        }
        self.source_path = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };

        if !self.destination_url.starts_with("http://")
            && !self.destination_url.starts_with("https://")
        {
            return Err(GatewayError::invalid(format!(
                "destination_url must be an http(s) URL, got '{}'",
                self.destination_url
            )));
        }

        if let Some(filter) = &self.filter_query {
            if filter.trim().is_empty() {
                self.filter_query = None;
            }
        }

        Ok(self)
    }
}

/// Metadata row for a webhook-scoped reference table.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceTable {
    pub id: ReferenceTableId,
    pub webhook_id: WebhookId,
    pub table_name: String,
    pub physical_table: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata row for a webhook-scoped scalar UDF.
#[derive(Debug, Clone, Serialize)]
pub struct ScalarUdf {
    pub id: UdfId,
    pub webhook_id: WebhookId,
    pub function_name: String,
    pub physical_name: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Catalog
// ============================================================================

/// CRUD and lookup over the metadata tables.
#[derive(Clone)]
pub struct Catalog {
    engine: StorageEngine,
}

const WEBHOOK_COLUMNS: &str = "id, source_path, destination_url, transform_query, filter_query, \
                               owner, active, created_at, updated_at";

impl Catalog {
    pub fn new(engine: StorageEngine) -> Self {
        Self { engine }
    }

    /// Register a new webhook.
    ///
    /// Fails `Conflict` if the source path is already registered and
    /// `Invalid` if the transform lacks the `{{payload}}` token or either
    /// SQL fragment fails dry validation.
    pub async fn register_webhook(&self, spec: WebhookSpec) -> GatewayResult<Webhook> {
        let spec = spec.normalized()?;
        self.validate_queries(&spec).await?;

        let now = Utc::now();
        let webhook = Webhook {
            id: WebhookId::new(),
            source_path: spec.source_path,
            destination_url: spec.destination_url,
            transform_query: spec.transform_query,
            filter_query: spec.filter_query,
            owner: spec.owner,
            active: true,
            created_at: now,
            updated_at: now,
        };

        let inserted = webhook.clone();
        self.engine
            .with_txn(move |conn| {
                ensure_path_free(conn, &inserted.source_path, None)?;
                conn.execute(
                    "INSERT INTO webhooks (id, source_path, destination_url, transform_query, \
                     filter_query, owner, active, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        inserted.id.to_string(),
                        inserted.source_path,
                        inserted.destination_url,
                        inserted.transform_query,
                        inserted.filter_query,
                        inserted.owner,
                        inserted.active,
                        inserted.created_at,
                        inserted.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await?;

        info!(webhook_id = %webhook.id, path = %webhook.source_path, "registered webhook");
        Ok(webhook)
    }

    /// All webhooks, most recently updated first.
    pub async fn list_webhooks(&self) -> GatewayResult<Vec<Webhook>> {
        let sql = format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks ORDER BY updated_at DESC");
        self.engine
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(webhook_from_row(row)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn get_webhook(&self, id: WebhookId) -> GatewayResult<Webhook> {
        let sql = format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = ?");
        self.engine
            .with_conn(move |conn| {
                match conn.query_row(&sql, params![id.to_string()], webhook_from_row) {
                    Ok(webhook) => Ok(webhook),
                    Err(duckdb::Error::QueryReturnedNoRows) => {
                        Err(GatewayError::not_found("webhook", id))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// Look up a webhook by its source path regardless of active state.
    pub async fn get_webhook_by_path(&self, path: &str) -> GatewayResult<Webhook> {
        self.webhook_by_path(path, false).await
    }

    /// Ingress lookup: only active webhooks are addressable.
    pub async fn active_webhook_by_path(&self, path: &str) -> GatewayResult<Webhook> {
        self.webhook_by_path(path, true).await
    }

    async fn webhook_by_path(&self, path: &str, active_only: bool) -> GatewayResult<Webhook> {
        let sql = if active_only {
            format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE source_path = ? AND active")
        } else {
            format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE source_path = ?")
        };
        let path = path.to_string();
        self.engine
            .with_conn(move |conn| match conn.query_row(&sql, params![path], webhook_from_row) {
                Ok(webhook) => Ok(webhook),
                Err(duckdb::Error::QueryReturnedNoRows) => {
                    Err(GatewayError::not_found("webhook path", path))
                }
                Err(e) => Err(e.into()),
            })
            .await
    }

    /// Replace a webhook's configuration. Validation matches registration;
    /// moving onto another webhook's path fails `Conflict`.
    pub async fn update_webhook(&self, id: WebhookId, spec: WebhookSpec) -> GatewayResult<Webhook> {
        let spec = spec.normalized()?;
        self.validate_queries(&spec).await?;

        let existing = self.get_webhook(id).await?;
        let updated = Webhook {
            id,
            source_path: spec.source_path,
            destination_url: spec.destination_url,
            transform_query: spec.transform_query,
            filter_query: spec.filter_query,
            owner: spec.owner,
            active: existing.active,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };

        let written = updated.clone();
        self.engine
            .with_txn(move |conn| {
                ensure_path_free(conn, &written.source_path, Some(written.id))?;
                conn.execute(
                    "UPDATE webhooks SET source_path = ?, destination_url = ?, \
                     transform_query = ?, filter_query = ?, owner = ?, updated_at = ? \
                     WHERE id = ?",
                    params![
                        written.source_path,
                        written.destination_url,
                        written.transform_query,
                        written.filter_query,
                        written.owner,
                        written.updated_at,
                        written.id.to_string(),
                    ],
                )?;
                Ok(())
            })
            .await?;

        info!(webhook_id = %updated.id, path = %updated.source_path, "updated webhook");
        Ok(updated)
    }

    /// Flip the active flag. Inactive webhooks keep their path reserved but
    /// stop accepting ingress traffic.
    pub async fn set_active(&self, id: WebhookId, active: bool) -> GatewayResult<Webhook> {
        let now = Utc::now();
        let affected = self
            .engine
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "UPDATE webhooks SET active = ?, updated_at = ? WHERE id = ?",
                    params![active, now, id.to_string()],
                )?)
            })
            .await?;

        if affected == 0 {
            return Err(GatewayError::not_found("webhook", id));
        }
        info!(webhook_id = %id, active, "toggled webhook status");
        self.get_webhook(id).await
    }

    /// Delete a webhook, cascading through the installer so its physical
    /// reference tables and UDFs are dropped. Historical raw and transformed
    /// events are preserved.
    pub async fn delete_webhook(&self, id: WebhookId) -> GatewayResult<()> {
        // Existence check first so deletes of unknown ids report NotFound.
        self.get_webhook(id).await?;

        crate::artifacts::drop_webhook_artifacts(&self.engine, id).await?;

        self.engine
            .with_conn(move |conn| {
                conn.execute("DELETE FROM webhooks WHERE id = ?", params![id.to_string()])?;
                Ok(())
            })
            .await?;

        info!(webhook_id = %id, "deleted webhook");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Artifact metadata reads
    // ------------------------------------------------------------------

    pub async fn list_reference_tables(&self) -> GatewayResult<Vec<ReferenceTable>> {
        self.reference_table_query("ORDER BY updated_at DESC", None)
            .await
    }

    pub async fn reference_tables_for_webhook(
        &self,
        webhook_id: WebhookId,
    ) -> GatewayResult<Vec<ReferenceTable>> {
        self.reference_table_query("WHERE webhook_id = ? ORDER BY updated_at DESC", Some(webhook_id))
            .await
    }

    pub async fn get_reference_table(&self, id: ReferenceTableId) -> GatewayResult<ReferenceTable> {
        let sql = "SELECT id, webhook_id, table_name, physical_table, description, \
                   created_at, updated_at FROM reference_tables WHERE id = ?";
        self.engine
            .with_conn(move |conn| {
                match conn.query_row(sql, params![id.to_string()], reference_table_from_row) {
                    Ok(table) => Ok(table),
                    Err(duckdb::Error::QueryReturnedNoRows) => {
                        Err(GatewayError::not_found("reference table", id))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn reference_table_query(
        &self,
        suffix: &str,
        webhook_id: Option<WebhookId>,
    ) -> GatewayResult<Vec<ReferenceTable>> {
        let sql = format!(
            "SELECT id, webhook_id, table_name, physical_table, description, \
             created_at, updated_at FROM reference_tables {suffix}"
        );
        self.engine
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = match webhook_id {
                    Some(id) => stmt.query(params![id.to_string()])?,
                    None => stmt.query([])?,
                };
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(reference_table_from_row(row)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn list_udfs(&self) -> GatewayResult<Vec<ScalarUdf>> {
        self.udf_query("ORDER BY updated_at DESC", None).await
    }

    pub async fn udfs_for_webhook(&self, webhook_id: WebhookId) -> GatewayResult<Vec<ScalarUdf>> {
        self.udf_query("WHERE webhook_id = ? ORDER BY updated_at DESC", Some(webhook_id))
            .await
    }

    pub async fn get_udf(&self, id: UdfId) -> GatewayResult<ScalarUdf> {
        let sql = "SELECT id, webhook_id, function_name, physical_name, source, \
                   created_at, updated_at FROM udfs WHERE id = ?";
        self.engine
            .with_conn(move |conn| {
                match conn.query_row(sql, params![id.to_string()], udf_from_row) {
                    Ok(udf) => Ok(udf),
                    Err(duckdb::Error::QueryReturnedNoRows) => {
                        Err(GatewayError::not_found("UDF", id))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn udf_query(
        &self,
        suffix: &str,
        webhook_id: Option<WebhookId>,
    ) -> GatewayResult<Vec<ScalarUdf>> {
        let sql = format!(
            "SELECT id, webhook_id, function_name, physical_name, source, \
             created_at, updated_at FROM udfs {suffix}"
        );
        self.engine
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = match webhook_id {
                    Some(id) => stmt.query(params![id.to_string()])?,
                    None => stmt.query([])?,
                };
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(udf_from_row(row)?);
                }
                Ok(out)
            })
            .await
    }

    // ------------------------------------------------------------------
    // Dry validation
    // ------------------------------------------------------------------

    /// Parse-check the transform and filter against a synthetic view name.
    async fn validate_queries(&self, spec: &WebhookSpec) -> GatewayResult<()> {
        if !contains_payload_token(&spec.transform_query) {
            return Err(GatewayError::invalid(
                "transform_query must include the {{payload}} placeholder",
            ));
        }

        let transform = substitute_payload_token(&spec.transform_query, DRY_RUN_VIEW);
        self.engine
            .check_select_syntax(&transform)
            .await
            .map_err(|e| prefix_invalid("transform_query", e))?;

        if let Some(filter) = &spec.filter_query {
            let filter = substitute_payload_token(filter, DRY_RUN_VIEW);
            let probe = format!("SELECT ({filter}) FROM {DRY_RUN_VIEW}");
            self.engine
                .check_select_syntax(&probe)
                .await
                .map_err(|e| prefix_invalid("filter_query", e))?;
        }
        Ok(())
    }
}

fn prefix_invalid(field: &str, err: GatewayError) -> GatewayError {
    match err {
        GatewayError::Invalid { message } => {
            GatewayError::invalid(format!("{field}: {message}"))
        }
        other => other,
    }
}

/// Fail `Conflict` when `path` is registered to a webhook other than `except`.
fn ensure_path_free(
    conn: &Connection,
    path: &str,
    except: Option<WebhookId>,
) -> GatewayResult<()> {
    let holder = match conn.query_row(
        "SELECT id FROM webhooks WHERE source_path = ?",
        params![path],
        |row| row.get::<_, String>(0),
    ) {
        Ok(id) => id,
        Err(duckdb::Error::QueryReturnedNoRows) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if except.map(|id| id.to_string()).as_deref() == Some(holder.as_str()) {
        return Ok(());
    }
    Err(GatewayError::conflict(format!(
        "source_path '{path}' is already registered"
    )))
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_uuid_column(idx: usize, value: String) -> duckdb::Result<Uuid> {
    Uuid::parse_str(&value).map_err(|e| {
        duckdb::Error::FromSqlConversionFailure(idx, duckdb::types::Type::Text, Box::new(e))
    })
}

fn webhook_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Webhook> {
    Ok(Webhook {
        id: WebhookId::from_uuid(parse_uuid_column(0, row.get(0)?)?),
        source_path: row.get(1)?,
        destination_url: row.get(2)?,
        transform_query: row.get(3)?,
        filter_query: row.get(4)?,
        owner: row.get(5)?,
        active: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn reference_table_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<ReferenceTable> {
    Ok(ReferenceTable {
        id: ReferenceTableId::from_uuid(parse_uuid_column(0, row.get(0)?)?),
        webhook_id: WebhookId::from_uuid(parse_uuid_column(1, row.get(1)?)?),
        table_name: row.get(2)?,
        physical_table: row.get(3)?,
        description: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn udf_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<ScalarUdf> {
    Ok(ScalarUdf {
        id: UdfId::from_uuid(parse_uuid_column(0, row.get(0)?)?),
        webhook_id: WebhookId::from_uuid(parse_uuid_column(1, row.get(1)?)?),
        function_name: row.get(2)?,
        physical_name: row.get(3)?,
        source: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
#[path = "catalog_tests.rs"]
mod tests;

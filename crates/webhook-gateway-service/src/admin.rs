//! Admin API handlers.
//!
//! Thin adapters from HTTP to catalog/installer/event-log operations. All
//! routes here sit behind the API-key middleware in the router; errors map
//! to HTTP statuses through [`ApiError`].

use std::io::Write as _;

use axum::extract::{Multipart, Path, Query, State};
use axum::response::Json;
use axum::Form;
use serde::{Deserialize, Serialize};
use tracing::info;

use webhook_gateway_core::{
    artifacts, EventDetail, EventSummary, GatewayError, GatewayStats, QueryOutput, RawEventId,
    ReferenceTable, ReferenceTableId, ScalarUdf, UdfId, Webhook, WebhookId, WebhookSpec,
};

use crate::{ApiError, AppState};

// ============================================================================
// Webhooks
// ============================================================================

/// `POST /register`: register a new webhook, returning the created row.
pub async fn register_webhook(
    State(state): State<AppState>,
    Json(spec): Json<WebhookSpec>,
) -> Result<Json<Webhook>, ApiError> {
    let webhook = state.catalog.register_webhook(spec).await?;
    Ok(Json(webhook))
}

/// `GET /webhooks`
pub async fn list_webhooks(
    State(state): State<AppState>,
) -> Result<Json<WebhookListResponse>, ApiError> {
    let webhooks = state.catalog.list_webhooks().await?;
    Ok(Json(WebhookListResponse { webhooks }))
}

/// `GET /webhook/{id}`
pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Webhook>, ApiError> {
    let id: WebhookId = id.parse()?;
    Ok(Json(state.catalog.get_webhook(id).await?))
}

/// `PUT /webhook/{id}`: replace the configuration.
pub async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(spec): Json<WebhookSpec>,
) -> Result<Json<Webhook>, ApiError> {
    let id: WebhookId = id.parse()?;
    Ok(Json(state.catalog.update_webhook(id, spec).await?))
}

/// `PATCH /webhook/{id}/status`: flip the active flag.
pub async fn set_webhook_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdateRequest>,
) -> Result<Json<Webhook>, ApiError> {
    let id: WebhookId = id.parse()?;
    Ok(Json(state.catalog.set_active(id, update.active).await?))
}

/// `DELETE /webhook/{id}`: cascade physical artifacts, preserve events.
pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteAck>, ApiError> {
    let id: WebhookId = id.parse()?;
    state.catalog.delete_webhook(id).await?;
    Ok(Json(DeleteAck { deleted: true }))
}

// ============================================================================
// Reference tables
// ============================================================================

/// `POST /upload_table`: multipart upload of a CSV reference table.
///
/// Fields: `webhook_id`, `table_name`, `description`, `file`.
pub async fn upload_table(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ReferenceTable>, ApiError> {
    let mut fields = MultipartFields::collect(multipart).await?;

    let webhook_id: WebhookId = fields.require_text("webhook_id")?.parse()?;
    let table_name = fields.require_text("table_name")?;
    let description = fields.take_text("description").unwrap_or_default();
    let file = fields.require_file("file")?;

    // The engine loads CSV from a path, so spool the upload to disk first.
    let mut spooled = tempfile::NamedTempFile::new().map_err(spool_error)?;
    spooled.write_all(&file).map_err(spool_error)?;
    spooled.flush().map_err(spool_error)?;

    let table = artifacts::upload_reference_table(
        &state.engine,
        webhook_id,
        &table_name,
        &description,
        spooled.path(),
    )
    .await?;

    info!(webhook_id = %webhook_id, table = %table.table_name, "reference table uploaded");
    Ok(Json(table))
}

/// `GET /reference_tables`
pub async fn list_reference_tables(
    State(state): State<AppState>,
) -> Result<Json<ReferenceTableListResponse>, ApiError> {
    let reference_tables = state.catalog.list_reference_tables().await?;
    Ok(Json(ReferenceTableListResponse { reference_tables }))
}

/// `GET /reference_tables/{webhook_id}`
pub async fn reference_tables_for_webhook(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
) -> Result<Json<ReferenceTableListResponse>, ApiError> {
    let webhook_id: WebhookId = webhook_id.parse()?;
    let reference_tables = state.catalog.reference_tables_for_webhook(webhook_id).await?;
    Ok(Json(ReferenceTableListResponse { reference_tables }))
}

/// `DELETE /reference_table/{id}`
pub async fn delete_reference_table(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteAck>, ApiError> {
    let id: ReferenceTableId = id.parse()?;
    artifacts::delete_reference_table(&state.engine, id).await?;
    Ok(Json(DeleteAck { deleted: true }))
}

// ============================================================================
// UDFs
// ============================================================================

/// `POST /register_udf`: multipart registration of a scalar UDF.
///
/// Fields: `webhook_id`, `function_name`, `function_code`.
pub async fn register_udf(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ScalarUdf>, ApiError> {
    let mut fields = MultipartFields::collect(multipart).await?;

    let webhook_id: WebhookId = fields.require_text("webhook_id")?.parse()?;
    let function_name = fields.require_text("function_name")?;
    let function_code = fields.require_text("function_code")?;

    let udf =
        artifacts::register_udf(&state.engine, webhook_id, &function_name, &function_code).await?;

    info!(webhook_id = %webhook_id, function = %udf.function_name, "UDF registered");
    Ok(Json(udf))
}

/// `GET /udfs`
pub async fn list_udfs(State(state): State<AppState>) -> Result<Json<UdfListResponse>, ApiError> {
    let udfs = state.catalog.list_udfs().await?;
    Ok(Json(UdfListResponse { udfs }))
}

/// `GET /udfs/{webhook_id}`
pub async fn udfs_for_webhook(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
) -> Result<Json<UdfListResponse>, ApiError> {
    let webhook_id: WebhookId = webhook_id.parse()?;
    let udfs = state.catalog.udfs_for_webhook(webhook_id).await?;
    Ok(Json(UdfListResponse { udfs }))
}

/// `DELETE /udf/{id}`
pub async fn delete_udf(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteAck>, ApiError> {
    let id: UdfId = id.parse()?;
    artifacts::delete_udf(&state.engine, id).await?;
    Ok(Json(DeleteAck { deleted: true }))
}

// ============================================================================
// Audit trail and analytics
// ============================================================================

/// `GET /stats`
pub async fn stats(State(state): State<AppState>) -> Result<Json<GatewayStats>, ApiError> {
    Ok(Json(state.event_log.stats().await?))
}

/// `GET /events?limit=N`
pub async fn recent_events(
    State(state): State<AppState>,
    Query(params): Query<EventListParams>,
) -> Result<Json<EventListResponse>, ApiError> {
    let events = state
        .event_log
        .recent_events(params.limit.unwrap_or(50))
        .await?;
    Ok(Json(EventListResponse { events }))
}

/// `GET /event/{id}/transformed`
pub async fn event_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EventDetail>, ApiError> {
    let id: RawEventId = id.parse()?;
    Ok(Json(state.event_log.event_detail(id).await?))
}

/// `POST /query`: ad-hoc SQL against the engine, sharing its mutex like
/// every other operation.
pub async fn query(
    State(state): State<AppState>,
    Form(request): Form<QueryRequest>,
) -> Result<Json<QueryOutput>, ApiError> {
    Ok(Json(state.engine.query_json(&request.query).await?))
}

// ============================================================================
// Request and response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct WebhookListResponse {
    pub webhooks: Vec<Webhook>,
}

#[derive(Debug, Serialize)]
pub struct ReferenceTableListResponse {
    pub reference_tables: Vec<ReferenceTable>,
}

#[derive(Debug, Serialize)]
pub struct UdfListResponse {
    pub udfs: Vec<ScalarUdf>,
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<EventSummary>,
}

#[derive(Debug, Serialize)]
pub struct DeleteAck {
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct EventListParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
}

// ============================================================================
// Multipart plumbing
// ============================================================================

/// Collected multipart fields: text fields by name plus raw file bytes.
struct MultipartFields {
    texts: Vec<(String, String)>,
    files: Vec<(String, bytes::Bytes)>,
}

impl MultipartFields {
    async fn collect(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut texts = Vec::new();
        let mut files = Vec::new();

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = match field.name() {
                Some(name) => name.to_string(),
                None => continue,
            };
            if field.file_name().is_some() {
                files.push((name, field.bytes().await.map_err(multipart_error)?));
            } else {
                texts.push((name, field.text().await.map_err(multipart_error)?));
            }
        }

        Ok(Self { texts, files })
    }

    fn take_text(&mut self, name: &str) -> Option<String> {
        let idx = self.texts.iter().position(|(n, _)| n == name)?;
        Some(self.texts.remove(idx).1)
    }

    fn require_text(&mut self, name: &str) -> Result<String, ApiError> {
        self.take_text(name).ok_or_else(|| {
            ApiError::from(GatewayError::invalid(format!(
                "missing multipart field '{name}'"
            )))
        })
    }

    fn require_file(&mut self, name: &str) -> Result<bytes::Bytes, ApiError> {
        let idx = self.files.iter().position(|(n, _)| n == name);
        match idx {
            Some(idx) => Ok(self.files.remove(idx).1),
            None => Err(ApiError::from(GatewayError::invalid(format!(
                "missing multipart file field '{name}'"
            )))),
        }
    }
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::from(GatewayError::invalid(format!(
        "malformed multipart request: {err}"
    )))
}

fn spool_error(err: std::io::Error) -> ApiError {
    ApiError::from(GatewayError::engine(format!(
        "failed to spool uploaded file: {err}"
    )))
}

#[cfg(test)]
#[path = "admin_tests.rs"]
mod tests;

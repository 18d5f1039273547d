//! Webhook ingress handler.
//!
//! Any POST that does not hit an admin route lands here. The path selects
//! the webhook; the body must be a JSON object. Acceptance means the raw
//! event was durably stored, so the response is 200 with the processing
//! outcome regardless of how dispatch went.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Json;
use serde_json::Value;
use tracing::{info, instrument};

use webhook_gateway_core::{GatewayError, IngressOutcome};

use crate::{ApiError, AppState};

/// `POST /{path}`: accept an event for the webhook registered on `path`.
///
/// Responses: 404 for unknown (or inactive) paths, 400 for non-JSON or
/// non-object bodies, 200 with the outcome for accepted events.
#[instrument(skip(state, headers, body))]
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngressOutcome>, ApiError> {
    let source_path = format!("/{}", path.trim_start_matches('/'));

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::invalid(format!("invalid JSON payload: {e}")))?;
    if !payload.is_object() {
        return Err(GatewayError::invalid("payload must be a JSON object").into());
    }

    let header_json = headers_to_json(&headers);

    let outcome = state
        .pipeline
        .handle_event(&source_path, &payload, &header_json)
        .await?;

    info!(path = %source_path, "ingress event accepted");
    Ok(Json(outcome))
}

/// Lower-cased header map as a JSON object, stored alongside the raw
/// payload for audit. Values that are not valid UTF-8 are dropped to an
/// empty string rather than rejecting the event.
fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::with_capacity(headers.len());
    for (name, value) in headers {
        map.insert(
            name.as_str().to_lowercase(),
            Value::String(value.to_str().unwrap_or("").to_string()),
        );
    }
    Value::Object(map)
}

#[cfg(test)]
#[path = "ingress_tests.rs"]
mod tests;

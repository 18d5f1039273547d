//! Tests for configuration, router wiring and error mapping.

use super::*;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use webhook_gateway_core::StorageEngine;

fn test_app() -> Router {
    let engine = StorageEngine::open_in_memory().expect("in-memory engine");
    let mut config = ServiceConfig::default();
    config.security.api_key = "test-key".to_string();
    let state = AppState::new(config, engine).expect("app state");
    create_router(state)
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn defaults_match_documented_values() {
    let config = ServiceConfig::default();

    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 8000);
    assert_eq!(config.security.api_key, "default_key");
    assert_eq!(
        config.engine.database_path,
        std::path::PathBuf::from("webhook_gateway.db")
    );
    assert_eq!(config.dispatch.timeout_seconds, 10);
    assert_eq!(config.dispatch.max_response_bytes, 64 * 1024);
}

// ============================================================================
// Router wiring
// ============================================================================

#[tokio::test]
async fn health_endpoint_needs_no_key() {
    let app = test_app();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_routes_reject_missing_key() {
    let app = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/webhooks")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_reject_wrong_key() {
    let app = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/webhooks")
                .header("x-api-key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_accept_the_configured_key() {
    let app = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/webhooks")
                .header("x-api-key", "test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// The ingress wildcard owns every non-admin POST path; a GET to an
/// arbitrary path therefore reports the method mismatch.
#[tokio::test]
async fn stray_get_hits_the_ingress_wildcard() {
    let app = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/no-such-route")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

// ============================================================================
// Error mapping
// ============================================================================

#[test]
fn gateway_errors_map_to_expected_statuses() {
    use axum::response::IntoResponse;

    let cases = [
        (GatewayError::Unauthorized, StatusCode::UNAUTHORIZED),
        (
            GatewayError::not_found("webhook", "x"),
            StatusCode::NOT_FOUND,
        ),
        (GatewayError::conflict("dup"), StatusCode::CONFLICT),
        (GatewayError::invalid("bad"), StatusCode::BAD_REQUEST),
        (
            GatewayError::engine("boom"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    ];

    for (error, expected) in cases {
        let response = ApiError::from(error).into_response();
        assert_eq!(response.status(), expected);
    }
}

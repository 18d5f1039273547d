//! Tests for the HTTP dispatcher.

use super::*;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dispatcher() -> Dispatcher {
    Dispatcher::new(DispatcherConfig::default()).expect("client should build")
}

#[tokio::test]
async fn successful_dispatch_records_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"t": "PushEvent"})))
        .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = dispatcher()
        .dispatch(&format!("{}/hook", server.uri()), &json!({"t": "PushEvent"}))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.response_code, 200);
    assert_eq!(outcome.response_body, "accepted");
}

/// A non-2xx response is a completed dispatch, not an error.
#[tokio::test]
async fn server_error_is_a_completed_unsuccessful_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let outcome = dispatcher().dispatch(&server.uri(), &json!({})).await;

    assert!(!outcome.success);
    assert_eq!(outcome.response_code, 500);
    assert_eq!(outcome.response_body, "boom");
}

/// Success tracks the 2xx range exactly.
#[tokio::test]
async fn success_is_true_iff_status_is_2xx() {
    for (status, expected) in [(200u16, true), (204, true), (299, true), (301, false), (404, false)] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let outcome = dispatcher().dispatch(&server.uri(), &json!({})).await;
        assert_eq!(
            outcome.success, expected,
            "status {status} should map to success={expected}"
        );
        assert_eq!(outcome.response_code, status);
    }
}

/// Network failures record status 0 with the error text as the body.
#[tokio::test]
async fn unreachable_destination_records_status_zero() {
    let outcome = dispatcher()
        .dispatch("http://127.0.0.1:1/unreachable", &json!({}))
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.response_code, 0);
    assert!(!outcome.response_body.is_empty());
}

#[tokio::test]
async fn response_body_is_truncated_to_the_configured_bound() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(1000)))
        .mount(&server)
        .await;

    let dispatcher = Dispatcher::new(DispatcherConfig {
        max_response_bytes: 100,
        ..DispatcherConfig::default()
    })
    .unwrap();

    let outcome = dispatcher.dispatch(&server.uri(), &json!({})).await;
    assert_eq!(outcome.response_body.len(), 100);
}

#[tokio::test]
async fn timeout_records_status_zero() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let dispatcher = Dispatcher::new(DispatcherConfig {
        timeout: std::time::Duration::from_millis(50),
        ..DispatcherConfig::default()
    })
    .unwrap();

    let outcome = dispatcher.dispatch(&server.uri(), &json!({})).await;
    assert!(!outcome.success);
    assert_eq!(outcome.response_code, 0);
}

#[test]
fn truncation_respects_char_boundaries() {
    // "é" is two bytes; cutting at byte 1 would split it.
    let truncated = truncate_body("é".repeat(10), 1);
    assert!(truncated.is_empty());

    let untouched = truncate_body("short".to_string(), 100);
    assert_eq!(untouched, "short");
}

//! HTTP forwarder for transformed payloads.
//!
//! A dispatch is an HTTP POST of the transformed JSON to the webhook's
//! destination URL. A non-2xx response is a completed dispatch with
//! `success = false`, not an error; network failures record status 0 with
//! the error text as the body. There is no retry here: redelivery is an
//! external concern built on the audit log.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::GatewayResult;

/// Tunables for the outbound HTTP client.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-call request timeout.
    pub timeout: Duration,
    /// Upper bound on the stored response body.
    pub max_response_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_response_bytes: 64 * 1024,
        }
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// True iff the destination answered with a 2xx status.
    pub success: bool,
    /// HTTP status, or 0 when the request never completed.
    pub response_code: u16,
    /// Response body (or error text), truncated to the configured bound.
    pub response_body: String,
    /// Wall-clock time of the attempt.
    pub elapsed: Duration,
}

/// Forwards transformed payloads to destination URLs.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    max_response_bytes: usize,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Dispatch {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            max_response_bytes: config.max_response_bytes,
        })
    }

    /// POST `payload` to `destination_url` as JSON and capture the outcome.
    /// Never fails: every result, including timeouts and refused
    /// connections, becomes a recordable [`DispatchOutcome`].
    pub async fn dispatch(&self, destination_url: &str, payload: &Value) -> DispatchOutcome {
        let started = Instant::now();

        match self.client.post(destination_url).json(payload).send().await {
            Ok(response) => {
                let status = response.status();
                let body = match response.text().await {
                    Ok(text) => text,
                    Err(e) => format!("failed to read response body: {e}"),
                };
                let outcome = DispatchOutcome {
                    success: status.is_success(),
                    response_code: status.as_u16(),
                    response_body: truncate_body(body, self.max_response_bytes),
                    elapsed: started.elapsed(),
                };
                info!(
                    destination = destination_url,
                    status = outcome.response_code,
                    success = outcome.success,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "dispatch completed"
                );
                outcome
            }
            Err(e) => {
                let outcome = DispatchOutcome {
                    success: false,
                    response_code: 0,
                    response_body: truncate_body(e.to_string(), self.max_response_bytes),
                    elapsed: started.elapsed(),
                };
                warn!(
                    destination = destination_url,
                    error = %e,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "dispatch failed to reach destination"
                );
                outcome
            }
        }
    }
}

/// Truncate to at most `max` bytes, backing off to a character boundary.
fn truncate_body(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;

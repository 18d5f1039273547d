//! Error taxonomy for the gateway core.
//!
//! Every fallible operation in this crate returns [`GatewayError`]. The kinds
//! mirror what the admin surface needs to map onto HTTP statuses; the event
//! pipeline additionally distinguishes evaluation failures (recorded on the
//! audit trail, never surfaced as an ingress error) from infrastructure
//! failures.

use thiserror::Error;

/// Structured error kinds for gateway operations
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Missing or mismatching admin API key
    #[error("invalid or missing API key")]
    Unauthorized,

    /// A referenced id or path is unknown
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Uniqueness violation (duplicate path, duplicate name under a webhook)
    #[error("{message}")]
    Conflict { message: String },

    /// Malformed input: unsafe identifier, SQL that fails dry validation,
    /// UDF compilation failure, or a transform lacking the payload token
    #[error("{message}")]
    Invalid { message: String },

    /// Filter or transform SQL failed at runtime on a real payload
    #[error("evaluation failed: {message}")]
    Evaluation { message: String },

    /// Dispatch infrastructure failure (client construction, not delivery
    /// outcomes; a non-2xx response is a completed dispatch, not an error)
    #[error("dispatch failed: {message}")]
    Dispatch { message: String },

    /// Underlying SQL engine failure, message preserved verbatim
    #[error("{message}")]
    Engine { message: String },
}

impl GatewayError {
    /// Build a `NotFound` error for a resource kind and id
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Build a `Conflict` error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Build an `Invalid` error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Build an `Evaluation` error
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    /// Build an `Engine` error
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }
}

impl From<duckdb::Error> for GatewayError {
    fn from(err: duckdb::Error) -> Self {
        // The engine message is kept verbatim for operator display.
        GatewayError::Engine {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

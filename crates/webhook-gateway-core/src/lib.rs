//! # Webhook Gateway Core
//!
//! Event-processing engine for the programmable webhook gateway.
//!
//! The gateway accepts HTTP events on dynamically registered paths, transforms
//! and filters each event with operator-supplied SQL, forwards the result to a
//! configured destination, and durably records both raw and transformed events
//! for audit and replay.
//!
//! This crate contains the engine-side pieces:
//! - A single-connection handle to the embedded DuckDB engine, serialized by
//!   one mutex ([`engine::StorageEngine`])
//! - The webhook/reference-table/UDF catalog ([`catalog::Catalog`])
//! - The artifact installer for CSV reference tables and scalar UDFs
//!   ([`artifacts`], [`udf`])
//! - The per-event transform/filter evaluator ([`evaluator`])
//! - The HTTP dispatcher ([`dispatcher::Dispatcher`])
//! - The append-only event log ([`audit::EventLog`])
//! - The per-event pipeline tying them together ([`pipeline::EventPipeline`])
//!
//! The HTTP ingress and admin surfaces live in the sibling service crate and
//! talk to this crate exclusively through the types re-exported below.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

// ============================================================================
// Identifier Types
// ============================================================================

/// Unique identifier for a registered webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookId(Uuid);

impl WebhookId {
    /// Generate a new unique webhook ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The webhook ID with dashes replaced by underscores, as used in
    /// physical table and function names.
    pub fn physical_component(&self) -> String {
        self.0.to_string().replace('-', "_")
    }
}

impl Default for WebhookId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WebhookId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = s
            .parse::<Uuid>()
            .map_err(|_| GatewayError::invalid(format!("not a valid webhook id: '{s}'")))?;
        Ok(Self(uuid))
    }
}

/// Unique identifier for a raw ingress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawEventId(Uuid);

impl RawEventId {
    /// Generate a new unique event ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for RawEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RawEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RawEventId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = s
            .parse::<Uuid>()
            .map_err(|_| GatewayError::invalid(format!("not a valid event id: '{s}'")))?;
        Ok(Self(uuid))
    }
}

/// Unique identifier for a reference table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceTableId(Uuid);

impl ReferenceTableId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for ReferenceTableId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReferenceTableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReferenceTableId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = s
            .parse::<Uuid>()
            .map_err(|_| GatewayError::invalid(format!("not a valid reference table id: '{s}'")))?;
        Ok(Self(uuid))
    }
}

/// Unique identifier for a registered scalar UDF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UdfId(Uuid);

impl UdfId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for UdfId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UdfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UdfId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = s
            .parse::<Uuid>()
            .map_err(|_| GatewayError::invalid(format!("not a valid UDF id: '{s}'")))?;
        Ok(Self(uuid))
    }
}

// ============================================================================
// Module declarations
// ============================================================================

/// Installer for per-webhook reference tables and scalar UDFs
pub mod artifacts;

/// Append-only raw/transformed event log and its query surface
pub mod audit;

/// Durable webhook and artifact metadata store
pub mod catalog;

/// HTTP forwarder for transformed payloads
pub mod dispatcher;

/// Single-connection handle to the embedded SQL engine
pub mod engine;

/// Error taxonomy for the gateway core
pub mod error;

/// Per-event transform/filter evaluation
pub mod evaluator;

/// Per-event processing pipeline
pub mod pipeline;

/// Declarative mini-language for scalar UDFs
pub mod udf;

// Re-export key types for convenience
pub use audit::{EventDetail, EventLog, EventSummary, GatewayStats, TransformedEventRecord};
pub use catalog::{Catalog, ReferenceTable, ScalarUdf, Webhook, WebhookSpec};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
pub use engine::{QueryOutput, StorageEngine};
pub use error::GatewayError;
pub use evaluator::Evaluation;
pub use pipeline::{EventPipeline, IngressOutcome};

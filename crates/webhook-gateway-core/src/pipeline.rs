//! Per-event processing pipeline.
//!
//! Control flow for one accepted event:
//! catalog lookup by path → raw-event write → evaluator (filter, transform)
//! → (if not filtered) dispatcher → transformed-event write → outcome.
//!
//! Ordering guarantees: the raw-event commit happens before the evaluator or
//! dispatcher run, so a crash after acceptance leaves a recoverable record;
//! the transformed-event commit happens after the dispatch attempt, so
//! exactly one row corresponds to each attempted delivery. Filtered events
//! write no transformed row at all.
//!
//! Evaluation and delivery problems never fail the caller: they are recorded
//! and reported in the outcome, because the raw event was already stored.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::audit::{EventLog, TransformedEventRecord};
use crate::catalog::Catalog;
use crate::dispatcher::Dispatcher;
use crate::engine::StorageEngine;
use crate::error::GatewayError;
use crate::evaluator::{self, Evaluation};
use crate::{GatewayResult, RawEventId};

/// What happened to one accepted event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngressOutcome {
    /// The destination acknowledged with a 2xx status.
    Delivered {
        event_id: RawEventId,
        response_code: u16,
    },
    /// Dispatch completed but did not succeed (non-2xx, or status 0 for a
    /// network failure).
    DeliveryFailed {
        event_id: RawEventId,
        response_code: u16,
    },
    /// The filter rejected the event; nothing was forwarded.
    Filtered { event_id: RawEventId },
    /// The operator's SQL failed on this payload; the error is on the
    /// audit trail.
    EvaluationFailed {
        event_id: RawEventId,
        error: String,
    },
}

/// Ties catalog, evaluator, dispatcher and event log together for ingress.
#[derive(Clone)]
pub struct EventPipeline {
    engine: StorageEngine,
    catalog: Catalog,
    event_log: EventLog,
    dispatcher: Dispatcher,
}

impl EventPipeline {
    pub fn new(engine: StorageEngine, dispatcher: Dispatcher) -> Self {
        Self {
            catalog: Catalog::new(engine.clone()),
            event_log: EventLog::new(engine.clone()),
            engine,
            dispatcher,
        }
    }

    /// Process one ingress event.
    ///
    /// Fails only when no active webhook owns `source_path` (NotFound) or on
    /// engine-level infrastructure errors; evaluation and delivery problems
    /// are folded into the returned outcome.
    #[instrument(skip(self, payload, headers), fields(path = source_path))]
    pub async fn handle_event(
        &self,
        source_path: &str,
        payload: &Value,
        headers: &Value,
    ) -> GatewayResult<IngressOutcome> {
        let webhook = self.catalog.active_webhook_by_path(source_path).await?;

        let event_id = self
            .event_log
            .record_raw_event(source_path, payload, headers)
            .await?;

        match evaluator::evaluate(&self.engine, &webhook, payload).await {
            Ok(Evaluation::Filtered) => {
                info!(event_id = %event_id, webhook_id = %webhook.id, "event filtered out");
                Ok(IngressOutcome::Filtered { event_id })
            }

            Ok(Evaluation::Transformed(transformed)) => {
                let outcome = self
                    .dispatcher
                    .dispatch(&webhook.destination_url, &transformed)
                    .await;

                self.event_log
                    .record_transformed_event(TransformedEventRecord {
                        raw_event_id: event_id,
                        webhook_id: webhook.id,
                        destination_url: webhook.destination_url.clone(),
                        transformed_payload: transformed,
                        success: outcome.success,
                        response_code: i32::from(outcome.response_code),
                        response_body: Some(outcome.response_body),
                    })
                    .await?;

                info!(
                    event_id = %event_id,
                    webhook_id = %webhook.id,
                    success = outcome.success,
                    response_code = outcome.response_code,
                    "event processed"
                );

                if outcome.success {
                    Ok(IngressOutcome::Delivered {
                        event_id,
                        response_code: outcome.response_code,
                    })
                } else {
                    Ok(IngressOutcome::DeliveryFailed {
                        event_id,
                        response_code: outcome.response_code,
                    })
                }
            }

            Err(GatewayError::Evaluation { message }) => {
                warn!(
                    event_id = %event_id,
                    webhook_id = %webhook.id,
                    error = %message,
                    "transform or filter failed on payload"
                );
                self.event_log
                    .record_transformed_event(TransformedEventRecord {
                        raw_event_id: event_id,
                        webhook_id: webhook.id,
                        destination_url: webhook.destination_url.clone(),
                        transformed_payload: Value::Object(serde_json::Map::new()),
                        success: false,
                        response_code: 0,
                        response_body: Some(message.clone()),
                    })
                    .await?;
                Ok(IngressOutcome::EvaluationFailed {
                    event_id,
                    error: message,
                })
            }

            Err(other) => Err(other),
        }
    }

    /// The catalog this pipeline reads from.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The event log this pipeline writes to.
    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;

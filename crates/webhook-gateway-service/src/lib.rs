//! # Webhook Gateway Service
//!
//! HTTP surface for the webhook gateway:
//! - dynamic webhook ingress on any registered path (`POST /{path}`)
//! - the admin API for registering webhooks, uploading reference tables,
//!   registering UDFs, browsing the audit trail and running ad-hoc queries
//!
//! Admin endpoints are authenticated with a shared secret in the
//! `X-API-Key` header. Ingress is unauthenticated by design: source systems
//! post plain JSON to their registered path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, patch, post};
use axum::{middleware, Router};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use webhook_gateway_core::{
    artifacts, Catalog, Dispatcher, DispatcherConfig, EventLog, EventPipeline, GatewayError,
    StorageEngine,
};

pub mod admin;
pub mod ingress;

// ============================================================================
// Configuration
// ============================================================================

/// Service configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub engine: EngineConfig,
    pub dispatch: DispatchConfig,
}

/// HTTP server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

/// Admin authentication settings
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Shared secret expected in the `X-API-Key` header
    pub api_key: String,
}

/// Embedded engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine data file
    pub database_path: PathBuf,
}

/// Outbound dispatch settings
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Per-call request timeout in seconds
    pub timeout_seconds: u64,

    /// Upper bound on stored response bodies
    pub max_response_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_key: "default_key".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("webhook_gateway.db"),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            max_response_bytes: 64 * 1024,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            security: SecurityConfig::default(),
            engine: EngineConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the environment, falling back to defaults
    /// for unset variables. Unparseable values are configuration errors.
    pub fn from_env() -> Result<Self, ServiceError> {
        let mut config = Self::default();

        if let Ok(key) = std::env::var("WEBHOOK_GATEWAY_API_KEY") {
            config.security.api_key = key;
        } else {
            warn!("WEBHOOK_GATEWAY_API_KEY not set, using the default key");
        }

        if let Ok(path) = std::env::var("DUCKDB_PATH") {
            config.engine.database_path = PathBuf::from(path);
        }

        if let Ok(host) = std::env::var("WEBHOOK_GATEWAY_HOST") {
            config.server.host = host;
        }

        if let Ok(port) = std::env::var("WEBHOOK_GATEWAY_PORT") {
            config.server.port = port.parse().map_err(|_| ServiceError::Configuration {
                message: format!("WEBHOOK_GATEWAY_PORT is not a valid port: '{port}'"),
            })?;
        }

        if let Ok(secs) = std::env::var("WEBHOOK_GATEWAY_DISPATCH_TIMEOUT_SECS") {
            config.dispatch.timeout_seconds =
                secs.parse().map_err(|_| ServiceError::Configuration {
                    message: format!(
                        "WEBHOOK_GATEWAY_DISPATCH_TIMEOUT_SECS is not a number: '{secs}'"
                    ),
                })?;
        }

        Ok(config)
    }
}

// ============================================================================
// Application state
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Service configuration
    pub config: Arc<ServiceConfig>,

    /// Engine handle, shared with every component below
    pub engine: StorageEngine,

    /// Webhook and artifact metadata
    pub catalog: Catalog,

    /// Raw/transformed event log
    pub event_log: EventLog,

    /// Per-event processing pipeline
    pub pipeline: EventPipeline,
}

impl AppState {
    /// Assemble the application state around an open engine handle.
    pub fn new(config: ServiceConfig, engine: StorageEngine) -> Result<Self, ServiceError> {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            timeout: Duration::from_secs(config.dispatch.timeout_seconds),
            max_response_bytes: config.dispatch.max_response_bytes,
        })?;

        Ok(Self {
            catalog: Catalog::new(engine.clone()),
            event_log: EventLog::new(engine.clone()),
            pipeline: EventPipeline::new(engine.clone(), dispatcher),
            engine,
            config: Arc::new(config),
        })
    }
}

// ============================================================================
// Router
// ============================================================================

/// Build the HTTP router: admin endpoints behind the API key, webhook
/// ingress on every other POST path.
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/register", post(admin::register_webhook))
        .route("/webhooks", get(admin::list_webhooks))
        .route(
            "/webhook/{id}",
            get(admin::get_webhook)
                .put(admin::update_webhook)
                .delete(admin::delete_webhook),
        )
        .route("/webhook/{id}/status", patch(admin::set_webhook_status))
        .route("/upload_table", post(admin::upload_table))
        .route("/reference_tables", get(admin::list_reference_tables))
        .route(
            "/reference_tables/{webhook_id}",
            get(admin::reference_tables_for_webhook),
        )
        .route("/reference_table/{id}", delete(admin::delete_reference_table))
        .route("/register_udf", post(admin::register_udf))
        .route("/udfs", get(admin::list_udfs))
        .route("/udfs/{webhook_id}", get(admin::udfs_for_webhook))
        .route("/udf/{id}", delete(admin::delete_udf))
        .route("/stats", get(admin::stats))
        .route("/events", get(admin::recent_events))
        .route("/event/{id}/transformed", get(admin::event_detail))
        .route("/query", post(admin::query))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let ingress_routes = Router::new().route("/{*path}", post(ingress::handle_webhook));

    Router::new()
        .route("/health", get(health))
        .merge(admin_routes)
        .merge(ingress_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
        .with_state(state)
}

/// Liveness endpoint.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Admin authentication middleware: compare `X-API-Key` against the
/// configured shared secret.
async fn require_api_key(
    axum::extract::State(state): axum::extract::State<AppState>,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());

    if provided != Some(state.config.security.api_key.as_str()) {
        warn!(uri = %request.uri(), "admin request with missing or invalid API key");
        return ApiError::from(GatewayError::Unauthorized).into_response();
    }

    next.run(request).await
}

// ============================================================================
// Server
// ============================================================================

/// Open the engine, reconcile artifact metadata and serve until shutdown.
pub async fn start_server(config: ServiceConfig) -> Result<(), ServiceError> {
    let engine = StorageEngine::open(&config.engine.database_path)?;

    let swept = artifacts::reconcile(&engine).await?;
    if swept > 0 {
        warn!(swept, "swept orphan artifact metadata at startup");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|_| ServiceError::Configuration {
            message: format!(
                "invalid bind address {}:{}",
                config.server.host, config.server.port
            ),
        })?;

    let state = AppState::new(config, engine)?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServiceError::BindFailed {
            address: addr.to_string(),
            message: e.to_string(),
        })?;

    info!(%addr, "webhook gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServiceError::ServerFailed {
            message: e.to_string(),
        })?;

    info!("webhook gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to bind to {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("server failed: {message}")]
    ServerFailed { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error(transparent)]
    Core(#[from] GatewayError),
}

/// HTTP-facing wrapper around [`GatewayError`], mapping each kind to a
/// status code and a JSON error body.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Conflict { .. } => StatusCode::CONFLICT,
            GatewayError::Invalid { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Evaluation { .. }
            | GatewayError::Dispatch { .. }
            | GatewayError::Engine { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }

        let body = serde_json::json!({
            "error": self.0.to_string(),
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

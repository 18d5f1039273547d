use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webhook_gateway_service::{start_server, ServiceConfig, ServiceError};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "webhook_gateway_service=info,webhook_gateway_core=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting webhook gateway");

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(3);
        }
    };

    if let Err(e) = start_server(config).await {
        error!("server failed: {e}");

        let exit_code = match e {
            ServiceError::BindFailed { .. } => 1,
            ServiceError::ServerFailed { .. } => 2,
            ServiceError::Configuration { .. } => 3,
            ServiceError::Core(_) => 4,
        };
        std::process::exit(exit_code);
    }
}

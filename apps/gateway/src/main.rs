use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marquee_gateway::config::Config;
use marquee_gateway::gateway::fanout::{FanoutBus, MemoryBus, RedisBus};
use marquee_gateway::gateway::Gateway;
use marquee_gateway::services::{DataService, HttpDataService};
use marquee_gateway::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let settings = config.gateway_settings();

    let data: Arc<dyn DataService> =
        match HttpDataService::new(&config.data_service_url, Duration::from_secs(config.rpc_timeout_secs)) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                tracing::error!(%err, "failed to build data service client");
                return;
            }
        };

    let bus: Arc<dyn FanoutBus> = match &config.redis_url {
        Some(url) => match RedisBus::connect(url).await {
            Ok(bus) => Arc::new(bus),
            Err(err) => {
                tracing::error!(%err, "failed to connect to redis");
                return;
            }
        },
        None => {
            tracing::warn!("REDIS_URL not set; using in-process fan-out (single instance only)");
            Arc::new(MemoryBus::new())
        }
    };

    tracing::info!(
        instance_id = %settings.instance_id,
        data_service_url = %config.data_service_url,
        "gateway configured"
    );

    let gateway = Gateway::new(settings, data, bus);
    let shutdown = gateway.shutdown.clone();
    let state = AppState::new(gateway, config.internal_token.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(marquee_gateway::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, %addr, "failed to bind");
            return;
        }
    };
    tracing::info!(%addr, "gateway listening");

    let signal = async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
        }
        tracing::info!("shutting down");
        shutdown.cancel();
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
        tracing::error!(%err, "server error");
    }
}

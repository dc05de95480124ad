use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_api::config::Config;
use realtime_api::db::messages::{HttpMessageStore, MessageStore};
use realtime_api::RealtimeServices;

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
    let port = config.port;

    let store: Option<Arc<dyn MessageStore>> = match config.message_sink_url.as_deref() {
        Some(url) => match HttpMessageStore::new(url) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::error!(error = %e, "message store disabled");
                None
            }
        },
        None => {
            tracing::warn!("MESSAGE_SINK_URL not set, relayed messages are not persisted");
            None
        }
    };

    tracing::info!(
        origins = ?config.allowed_origins,
        identity = config.identity_secret.is_some(),
        bridge = config.bridge_secret.is_some(),
        "realtime-api configured"
    );

    let services = RealtimeServices::start(config, store);
    let app = services.app();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "realtime-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    let hub = services.state().hub;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Closing sockets lets axum's connection drain finish.
            hub.shutdown().await;
        })
        .await
        .expect("server error");

    services.shutdown().await;
    tracing::info!("realtime-api stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

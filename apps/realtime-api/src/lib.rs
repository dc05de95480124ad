pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::Router;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use auth::identity::IdentityVerifier;
use config::Config;
use db::messages::{spawn_writer, MessageStore};
use gateway::bridge::NotificationBridge;
use gateway::dispatcher::{Dispatcher, SweepPolicy};
use gateway::hub::{Hub, HubHandle};
use gateway::presence::PresenceRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: HubHandle,
    pub bridge: NotificationBridge,
    pub presence: Arc<PresenceRegistry>,
    pub verifier: IdentityVerifier,
}

/// The running background tasks behind an [`AppState`].
pub struct RealtimeServices {
    state: AppState,
    hub_task: JoinHandle<()>,
    writer_task: Option<JoinHandle<()>>,
}

impl RealtimeServices {
    /// Spawn the hub and, when a store is given, the message writer.
    pub fn start(config: Config, store: Option<Arc<dyn MessageStore>>) -> Self {
        let (persist, writer_task) = match store {
            Some(store) => {
                let (tx, task) = spawn_writer(store);
                (Some(tx), Some(task))
            }
            None => (None, None),
        };

        let verifier = IdentityVerifier::new(config.identity_secret.as_deref());
        let presence = Arc::new(PresenceRegistry::new());
        let dispatcher = Dispatcher::new(verifier.clone(), presence.clone(), persist);
        let policy = SweepPolicy {
            idle_timeout: config.idle_timeout,
            typing_ttl: config.typing_ttl,
            presence_grace: config.presence_grace,
        };
        let (hub, hub_task) = Hub::spawn(dispatcher, policy, config.hub_queue);
        let bridge = NotificationBridge::new(hub.clone(), config.bridge_send_timeout);

        Self {
            state: AppState {
                config: Arc::new(config),
                hub,
                bridge,
                presence,
                verifier,
            },
            hub_task,
            writer_task,
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// The full HTTP + WebSocket application.
    pub fn app(&self) -> Router {
        Router::new()
            .merge(routes::router())
            .layer(cors_layer(&self.state.config))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state())
    }

    /// Close every connection, stop the hub and flush queued messages.
    pub async fn shutdown(self) {
        self.state.hub.shutdown().await;
        if let Err(e) = self.hub_task.await {
            tracing::error!(?e, "hub task failed");
        }
        // The hub owned the only writer queue sender, so the writer drains
        // what is left and stops.
        if let Some(writer) = self.writer_task {
            if let Err(e) = writer.await {
                tracing::error!(?e, "message writer failed");
            }
        }
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if config.allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

pub mod health;
pub mod notifications;
pub mod presence;

use axum::Router;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest(
            "/api/v1",
            health::api_router()
                .merge(notifications::router())
                .merge(presence::router()),
        )
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::stats,
        notifications::send_notification,
        presence::get_presence,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            crate::gateway::bridge::NotifyRequest,
            crate::gateway::presence::PresenceStatus,
            health::HealthResponse,
            health::StatsResponse,
            notifications::AcceptedResponse,
            presence::PresenceResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Liveness and gateway counters"),
        (name = "Notifications", description = "Notification bridge"),
        (name = "Presence", description = "User presence"),
    )
)]
pub struct ApiDoc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::middleware::BridgeAuth;
use crate::error::ApiErrorBody;
use crate::gateway::presence::PresenceStatus;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/presence/{user_id}", get(get_presence))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub user_id: String,
    pub status: PresenceStatus,
    /// Identified connections currently open for the user.
    pub connections: usize,
}

#[utoipa::path(
    get,
    path = "/api/v1/presence/{user_id}",
    tag = "Presence",
    security(("bearer" = [])),
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "Current presence", body = PresenceResponse),
        (status = 401, description = "Missing or wrong bridge secret", body = ApiErrorBody),
    ),
)]
pub async fn get_presence(
    _auth: BridgeAuth,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        status: state.presence.status(&user_id),
        connections: state.presence.connection_count(&user_id),
        user_id,
    })
}

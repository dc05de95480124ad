use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Routes mounted under `/api/v1`.
pub fn api_router() -> Router<AppState> {
    Router::new().route("/stats", get(stats))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, description = "Process is up", body = HealthResponse)),
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    /// Open gateway connections.
    pub connections: usize,
    /// Rooms with at least one member.
    pub rooms: usize,
}

#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "Health",
    responses(
        (status = 200, description = "Live connection and room counts", body = StatsResponse),
        (status = 503, description = "Hub stopped", body = ApiErrorBody),
    ),
)]
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state
        .hub
        .stats()
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    Ok(Json(StatsResponse {
        connections: stats.connections,
        rooms: stats.rooms,
    }))
}

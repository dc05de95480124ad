//! Notification bridge endpoint for the request-handling layer.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use hearth_common::RoomKey;
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::middleware::BridgeAuth;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::gateway::bridge::NotifyRequest;
use crate::gateway::events::{EventError, Notification, NotificationEvent, MAX_USER_ID_LEN};
use crate::gateway::hub::HubError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/notifications", post(send_notification))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AcceptedResponse {
    pub status: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/notifications",
    tag = "Notifications",
    security(("bearer" = [])),
    request_body = NotifyRequest,
    responses(
        (status = 202, description = "Queued; delivered only if online", body = AcceptedResponse),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 401, description = "Missing or wrong bridge secret", body = ApiErrorBody),
        (status = 503, description = "Gateway saturated or stopped", body = ApiErrorBody),
    ),
)]
pub async fn send_notification(
    _auth: BridgeAuth,
    State(state): State<AppState>,
    Json(body): Json<NotifyRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let event = validate(body)?;
    let target = event.target_room.clone();

    state.bridge.submit(event).await.map_err(|e| {
        tracing::warn!(room = %target, error = %e, "notification not queued");
        match e {
            HubError::Busy => {
                ApiError::service_unavailable("Gateway is busy, notification dropped")
            }
            HubError::Closed => ApiError::service_unavailable("Gateway is not running"),
        }
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted".to_string(),
        }),
    ))
}

fn validate(body: NotifyRequest) -> Result<NotificationEvent, ApiError> {
    let mut errors = Vec::new();

    let user_id = body.target_user_id.trim();
    if user_id.is_empty() {
        errors.push(field_error("targetUserId", "is required"));
    } else if user_id.chars().count() > MAX_USER_ID_LEN {
        errors.push(field_error(
            "targetUserId",
            &format!("must be at most {MAX_USER_ID_LEN} characters"),
        ));
    } else if let Err(e) = RoomKey::parse(RoomKey::notification(user_id).as_str()) {
        errors.push(field_error("targetUserId", &e.to_string()));
    }

    let notification = match Notification::new(body.title, body.message, body.icon) {
        Ok(n) => Some(n),
        Err(EventError::InvalidField { field, reason, .. }) => {
            errors.push(field_error(field, &reason));
            None
        }
        Err(e) => {
            errors.push(field_error("body", &e.to_string()));
            None
        }
    };

    match notification {
        Some(notification) if errors.is_empty() => {
            Ok(NotificationEvent::for_user(user_id, notification))
        }
        _ => Err(ApiError::validation(errors)),
    }
}

fn field_error(field: &str, message: &str) -> FieldError {
    FieldError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: &str, title: &str) -> NotifyRequest {
        NotifyRequest {
            target_user_id: user.to_string(),
            title: title.to_string(),
            message: "body".to_string(),
            icon: None,
        }
    }

    #[test]
    fn validate_targets_user_room() {
        let event = validate(request(" u3 ", "Hello")).unwrap();
        assert_eq!(event.target_room.as_str(), "user-u3");
        assert_eq!(event.notification.title, "Hello");
    }

    #[test]
    fn validate_collects_every_field_error() {
        let err = validate(request("", "   ")).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let fields: Vec<_> = err
            .details
            .unwrap()
            .into_iter()
            .map(|f| f.field)
            .collect();
        assert_eq!(fields, ["targetUserId", "title"]);
    }

    #[test]
    fn validate_rejects_whitespace_in_user_id() {
        assert!(validate(request("u 3", "Hello")).is_err());
    }
}

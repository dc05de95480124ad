//! Bridge secret extraction for the HTTP notification endpoint.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::AppState;

/// Marker extracted when the caller presented the configured bridge secret
/// in `Authorization: Bearer <secret>`.
#[derive(Debug, Clone, Copy)]
pub struct BridgeAuth;

/// Rejection returned when the bearer secret is missing or wrong.
pub struct AuthError {
    message: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": self.message
            }
        });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

impl FromRequestParts<AppState> for BridgeAuth {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let expected = state.config.bridge_secret.as_deref().ok_or(AuthError {
            message: "Notification bridge is disabled",
        })?;

        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError {
                message: "Missing Authorization header",
            })?;

        let presented = header.strip_prefix("Bearer ").ok_or(AuthError {
            message: "Invalid Authorization header format",
        })?;

        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            return Err(AuthError {
                message: "Invalid bridge secret",
            });
        }

        Ok(BridgeAuth)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::constant_time_eq;

    #[test]
    fn constant_time_eq_compares_content_and_length() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret!"));
        assert!(constant_time_eq(b"", b""));
    }
}

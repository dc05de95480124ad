//! Notification bridge: how the non-realtime request layer pushes a live
//! notification into a user's private room.
//!
//! A notification is fire-and-forget. Callers get no delivery receipt, and a
//! bridge never surfaces an error: failures are logged and dropped so a
//! comment or like is never rolled back because the realtime side hiccuped.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::events::{Notification, NotificationEvent};
use super::hub::{HubError, HubHandle};

/// Body of `POST /api/v1/notifications`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    pub target_user_id: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Push `notification` to every live connection of `target_user_id`.
    /// Returns once the event is handed off or the attempt failed.
    async fn notify(&self, target_user_id: &str, notification: Notification);
}

// ---------------------------------------------------------------------------
// In-process bridge
// ---------------------------------------------------------------------------

/// Bridge for callers living in the realtime process.
#[derive(Clone)]
pub struct NotificationBridge {
    hub: HubHandle,
    send_timeout: Duration,
}

impl NotificationBridge {
    pub fn new(hub: HubHandle, send_timeout: Duration) -> Self {
        Self { hub, send_timeout }
    }

    /// Hand a notification to the hub, waiting at most the send timeout.
    pub async fn submit(&self, event: NotificationEvent) -> Result<(), HubError> {
        self.hub.notify(event, self.send_timeout).await
    }
}

#[async_trait]
impl Notifier for NotificationBridge {
    async fn notify(&self, target_user_id: &str, notification: Notification) {
        let event = NotificationEvent::for_user(target_user_id, notification);
        if let Err(e) = self.submit(event).await {
            tracing::warn!(target_user_id, error = %e, "notification not delivered");
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP bridge
// ---------------------------------------------------------------------------

/// Request timeout for one bridge call.
const HTTP_NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Bridge for callers in another process. POSTs to the realtime process's
/// notification endpoint.
pub struct HttpBridge {
    client: reqwest::Client,
    endpoint: String,
    secret: String,
}

impl HttpBridge {
    /// `base_url` is the realtime process root, e.g. `http://localhost:4003`.
    pub fn new(base_url: &str, secret: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_NOTIFY_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/v1/notifications", base_url.trim_end_matches('/')),
            secret: secret.into(),
        })
    }
}

#[async_trait]
impl Notifier for HttpBridge {
    async fn notify(&self, target_user_id: &str, notification: Notification) {
        let body = NotifyRequest {
            target_user_id: target_user_id.to_string(),
            title: notification.title,
            message: notification.message,
            icon: notification.icon,
        };

        let result = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.secret)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!(
                    target_user_id,
                    status = resp.status().as_u16(),
                    "notification bridge call rejected"
                );
            }
            Err(e) => {
                tracing::warn!(target_user_id, error = %e, "notification bridge unreachable");
            }
        }
    }
}

//! WebSocket upgrade handler and per-connection event loop.

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};

use crate::auth::identity::Identity;
use crate::error::ApiError;
use crate::AppState;

use super::events::{ClientEvent, EventError};
use super::registry::{CloseReason, ConnectionId, Outbound, OutboundReceiver};

/// Close code sent when the hub cannot take the connection.
const CLOSE_UNAVAILABLE: u16 = 1011;

#[derive(Debug, Deserialize)]
struct ConnectParams {
    /// Identity token; connections without one start anonymous.
    token: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/realtime", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
) -> Response {
    if let Some(origin) = headers.get(ORIGIN) {
        let allowed = origin
            .to_str()
            .is_ok_and(|origin| state.config.origin_allowed(origin));
        if !allowed {
            tracing::debug!(origin = ?origin, "websocket upgrade from disallowed origin");
            return ApiError::forbidden("Origin not allowed").into_response();
        }
    }

    let identity = match params.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => match state.verifier.verify(token) {
            Ok(identity) => Some(identity),
            Err(reason) => return ApiError::unauthorized(reason).into_response(),
        },
        None => None,
    };

    ws.on_upgrade(move |socket| handle_connection(socket, state, identity))
}

async fn handle_connection(mut socket: WebSocket, state: AppState, identity: Option<Identity>) {
    let user_id = identity.as_ref().map(|i| i.user_id.clone());
    // One extra slot for the close frame the registry holds back.
    let capacity = state.config.outbound_buffer.saturating_add(1);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let id = match state.hub.connect(outbound_tx, identity).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting websocket connection");
            let _ = socket
                .send(close_message(CLOSE_UNAVAILABLE, "Server unavailable"))
                .await;
            return;
        }
    };

    tracing::info!(connection_id = %id, user_id = ?user_id, "gateway connection opened");
    run_connection(id, socket, outbound_rx, &state).await;

    // No-op if the hub already dropped the connection.
    state.hub.disconnect(id).await;
    tracing::info!(connection_id = %id, "gateway connection closed");
}

/// Pump frames both ways until either side closes.
async fn run_connection(
    id: ConnectionId,
    socket: WebSocket,
    mut outbound_rx: OutboundReceiver,
    state: &AppState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut ping = time::interval(state.config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            // Client sends us a frame.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.hub.touch(id);
                        match ClientEvent::parse(text.as_str()) {
                            Ok(event) => {
                                if state.hub.event(id, event).await.is_err() {
                                    break;
                                }
                            }
                            Err(EventError::UnknownEvent(name)) => {
                                tracing::debug!(
                                    connection_id = %id,
                                    event = %name,
                                    "unknown event dropped"
                                );
                            }
                            Err(e) => {
                                tracing::warn!(
                                    connection_id = %id,
                                    error = %e,
                                    "invalid frame dropped"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        state.hub.touch(id);
                        tracing::debug!(connection_id = %id, "binary frame ignored");
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => state.hub.touch(id),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %id, "ws read error");
                        break;
                    }
                }
            }

            // Event routed to us by the hub.
            item = outbound_rx.recv() => {
                match item {
                    Some(Outbound::Event(event)) => {
                        let json = match serde_json::to_string(&*event) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!(?e, event = event.name(), "failed to encode event");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        let _ = send_close(&mut ws_tx, reason).await;
                        break;
                    }
                    // The hub dropped the connection without a reason; it has stopped.
                    None => {
                        let _ = send_close(&mut ws_tx, CloseReason::ServerShutdown).await;
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

/// Send a WebSocket close frame for `reason`.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    reason: CloseReason,
) -> Result<(), axum::Error> {
    ws_tx.send(close_message(reason.code(), reason.reason())).await
}

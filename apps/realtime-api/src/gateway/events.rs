//! Gateway event vocabulary, wire-format frames, and ingress validation.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": {...}}`. Inbound frames are parsed into the
//! closed [`ClientEvent`] union before anything is routed; frames that do not
//! fit are rejected with an [`EventError`] and never broadcast.

use std::fmt;

use chrono::{DateTime, Utc};
use hearth_common::{MessageId, RoomKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::registry::ConnectionId;

/// Longest chat message body, in characters, after trimming.
pub const MAX_CONTENT_LEN: usize = 4000;
/// Longest user id accepted in a payload.
pub const MAX_USER_ID_LEN: usize = 128;
/// Longest display name accepted in a payload.
pub const MAX_USER_NAME_LEN: usize = 100;
/// Longest avatar or icon reference.
pub const MAX_URL_LEN: usize = 2048;
/// Longest notification title.
pub const MAX_TITLE_LEN: usize = 200;
/// Longest notification body.
pub const MAX_NOTIFICATION_MESSAGE_LEN: usize = 2000;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// Event names on the wire.
pub struct EventName;

impl EventName {
    // Client → server.
    pub const IDENTIFY: &'static str = "identify";
    pub const JOIN_ROOM: &'static str = "join-room";
    pub const LEAVE_ROOM: &'static str = "leave-room";
    pub const SEND_MESSAGE: &'static str = "send-message";
    pub const TYPING: &'static str = "typing";

    // Bridge → server.
    pub const SEND_NOTIFICATION: &'static str = "send-notification";

    // Server → client.
    pub const READY: &'static str = "ready";
    pub const RECEIVE_MESSAGE: &'static str = "receive-message";
    pub const USER_TYPING: &'static str = "user-typing";
    pub const USER_STOPPED_TYPING: &'static str = "user-stopped-typing";
    pub const NOTIFICATION: &'static str = "notification";
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an inbound frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Not a JSON `{event, data}` object.
    MalformedFrame(String),
    /// The `event` name is not part of the vocabulary.
    UnknownEvent(String),
    /// `data` does not have the shape the event requires.
    MalformedPayload { event: &'static str, reason: String },
    /// A field is missing or out of bounds.
    InvalidField {
        event: &'static str,
        field: &'static str,
        reason: String,
    },
    /// An identified connection claimed to be a different user.
    SenderMismatch {
        event: &'static str,
        claimed: String,
        actual: String,
    },
    /// The event is well-formed but this connection may not perform it.
    Forbidden {
        event: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedFrame(reason) => write!(f, "malformed frame: {reason}"),
            Self::UnknownEvent(name) => write!(f, "unknown event {name:?}"),
            Self::MalformedPayload { event, reason } => {
                write!(f, "{event}: malformed payload: {reason}")
            }
            Self::InvalidField {
                event,
                field,
                reason,
            } => write!(f, "{event}: field {field} {reason}"),
            Self::SenderMismatch {
                event,
                claimed,
                actual,
            } => write!(
                f,
                "{event}: connection identified as {actual} claimed sender {claimed}"
            ),
            Self::Forbidden { event, reason } => write!(f, "{event}: {reason}"),
        }
    }
}

impl std::error::Error for EventError {}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// A raw frame received from the client.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// `join-room` / `leave-room` accept either a bare key or `{ "roomKey": ... }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RoomRef {
    Key(String),
    Object {
        #[serde(rename = "roomKey", alias = "room")]
        room_key: String,
    },
}

#[derive(Debug, Deserialize)]
struct IdentifyData {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageData {
    room: Option<String>,
    user_id: Option<String>,
    user_name: Option<String>,
    user_image: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingData {
    room: Option<String>,
    user_id: Option<String>,
}

/// A chat message as submitted by a client, before the sender is resolved
/// against the connection's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub room: RoomKey,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_image: Option<String>,
    pub content: String,
}

/// A typing signal as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingDraft {
    pub room: RoomKey,
    pub user_id: Option<String>,
}

/// The closed set of events a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Identify { token: String },
    JoinRoom(RoomKey),
    LeaveRoom(RoomKey),
    SendMessage(MessageDraft),
    Typing(TypingDraft),
}

impl ClientEvent {
    /// Parse and validate one text frame.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let frame: ClientFrame =
            serde_json::from_str(text).map_err(|e| EventError::MalformedFrame(e.to_string()))?;
        Self::from_frame(frame)
    }

    /// Validate an already-decoded frame.
    pub fn from_frame(frame: ClientFrame) -> Result<Self, EventError> {
        match frame.event.as_str() {
            EventName::IDENTIFY => {
                let event = EventName::IDENTIFY;
                let data: IdentifyData = payload(event, frame.data)?;
                let token = required(event, "token", data.token)?;
                Ok(Self::Identify { token })
            }
            EventName::JOIN_ROOM => Ok(Self::JoinRoom(room_ref(EventName::JOIN_ROOM, frame.data)?)),
            EventName::LEAVE_ROOM => {
                Ok(Self::LeaveRoom(room_ref(EventName::LEAVE_ROOM, frame.data)?))
            }
            EventName::SEND_MESSAGE => {
                let event = EventName::SEND_MESSAGE;
                let data: SendMessageData = payload(event, frame.data)?;
                let room = room_field(event, "room", data.room)?;
                let content = required(event, "content", data.content)?;
                let content = content.trim();
                if content.is_empty() {
                    return Err(invalid(event, "content", "is empty"));
                }
                check_len(event, "content", content, MAX_CONTENT_LEN)?;

                Ok(Self::SendMessage(MessageDraft {
                    room,
                    user_id: optional_bounded(event, "userId", data.user_id, MAX_USER_ID_LEN)?,
                    user_name: optional_bounded(
                        event,
                        "userName",
                        data.user_name,
                        MAX_USER_NAME_LEN,
                    )?,
                    user_image: optional_bounded(event, "userImage", data.user_image, MAX_URL_LEN)?,
                    content: content.to_string(),
                }))
            }
            EventName::TYPING => {
                let event = EventName::TYPING;
                let data: TypingData = payload(event, frame.data)?;
                Ok(Self::Typing(TypingDraft {
                    room: room_field(event, "room", data.room)?,
                    user_id: optional_bounded(event, "userId", data.user_id, MAX_USER_ID_LEN)?,
                }))
            }
            // Notifications enter through the bridge, never from a socket.
            EventName::SEND_NOTIFICATION => Err(EventError::Forbidden {
                event: EventName::SEND_NOTIFICATION,
                reason: "notifications are only accepted from the bridge",
            }),
            other => Err(EventError::UnknownEvent(other.to_string())),
        }
    }

    /// Wire name of this event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => EventName::IDENTIFY,
            Self::JoinRoom(_) => EventName::JOIN_ROOM,
            Self::LeaveRoom(_) => EventName::LEAVE_ROOM,
            Self::SendMessage(_) => EventName::SEND_MESSAGE,
            Self::Typing(_) => EventName::TYPING,
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    event: &'static str,
    data: Value,
) -> Result<T, EventError> {
    serde_json::from_value(data).map_err(|e| EventError::MalformedPayload {
        event,
        reason: e.to_string(),
    })
}

fn room_ref(event: &'static str, data: Value) -> Result<RoomKey, EventError> {
    let raw = match payload::<RoomRef>(event, data)? {
        RoomRef::Key(key) => key,
        RoomRef::Object { room_key } => room_key,
    };
    room_field(event, "roomKey", Some(raw))
}

fn room_field(
    event: &'static str,
    field: &'static str,
    raw: Option<String>,
) -> Result<RoomKey, EventError> {
    let raw = required(event, field, raw)?;
    RoomKey::parse(&raw).map_err(|e| invalid(event, field, &e.to_string()))
}

fn required(
    event: &'static str,
    field: &'static str,
    value: Option<String>,
) -> Result<String, EventError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(invalid(event, field, "is required")),
    }
}

fn optional_bounded(
    event: &'static str,
    field: &'static str,
    value: Option<String>,
    max: usize,
) -> Result<Option<String>, EventError> {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) => {
            check_len(event, field, &v, max)?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

fn check_len(
    event: &'static str,
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<(), EventError> {
    let len = value.chars().count();
    if len > max {
        return Err(invalid(
            event,
            field,
            &format!("is {len} chars, limit is {max}"),
        ));
    }
    Ok(())
}

fn invalid(event: &'static str, field: &'static str, reason: &str) -> EventError {
    EventError::InvalidField {
        event,
        field,
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    pub connection_id: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A chat message as relayed to room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub room: RoomKey,
    pub user_id: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_image: Option<String>,
    pub content: String,
    /// Display time, minute resolution.
    pub timestamp: String,
    pub sent_at: DateTime<Utc>,
}

/// Transient "someone is typing" signal. Carries nothing beyond the tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub room: RoomKey,
    pub user_id: String,
}

/// Body of a live notification toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Notification {
    /// Build a validated notification body.
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        icon: Option<String>,
    ) -> Result<Self, EventError> {
        let event = EventName::SEND_NOTIFICATION;
        let title = title.into().trim().to_string();
        if title.is_empty() {
            return Err(invalid(event, "title", "is required"));
        }
        check_len(event, "title", &title, MAX_TITLE_LEN)?;
        let message = message.into();
        check_len(event, "message", &message, MAX_NOTIFICATION_MESSAGE_LEN)?;
        let icon = optional_bounded(event, "icon", icon, MAX_URL_LEN)?;
        Ok(Self {
            title,
            message,
            icon,
        })
    }
}

/// A notification addressed to a user's private room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub target_room: RoomKey,
    pub notification: Notification,
}

impl NotificationEvent {
    pub fn for_user(user_id: &str, notification: Notification) -> Self {
        Self {
            target_room: RoomKey::notification(user_id),
            notification,
        }
    }
}

/// Events the server writes to connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Ready(ReadyPayload),
    ReceiveMessage(ChatMessage),
    UserTyping(TypingSignal),
    UserStoppedTyping(TypingSignal),
    Notification(Notification),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready(_) => EventName::READY,
            Self::ReceiveMessage(_) => EventName::RECEIVE_MESSAGE,
            Self::UserTyping(_) => EventName::USER_TYPING,
            Self::UserStoppedTyping(_) => EventName::USER_STOPPED_TYPING,
            Self::Notification(_) => EventName::NOTIFICATION,
        }
    }
}

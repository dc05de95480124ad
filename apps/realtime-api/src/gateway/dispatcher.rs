//! Event dispatcher: applies validated client events to the registry and
//! router, and fans outbound events out to room members.
//!
//! Everything here is synchronous and runs on the hub task, so handlers never
//! wait on I/O. Outbound writes use `try_send` on each member's queue; the
//! persistence hand-off happens after the broadcast and never gates it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hearth_common::{MessageId, RoomKey, RoomKind};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::auth::identity::{Identity, IdentityVerifier};
use crate::db::messages::MessageRecord;

use super::events::{
    ChatMessage, ClientEvent, EventError, EventName, MessageDraft, NotificationEvent,
    ReadyPayload, ServerEvent, TypingDraft, TypingSignal,
};
use super::presence::{PresenceRegistry, TypingTracker};
use super::registry::{
    CloseReason, ConnectionId, ConnectionRegistry, Delivery, IdentifyError, OutboundSender,
};
use super::router::RoomRouter;

/// Display format of the server-stamped message time.
const TIMESTAMP_FORMAT: &str = "%H:%M";

/// Counters exposed by the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
}

/// Durations applied by [`Dispatcher::sweep`].
#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    pub idle_timeout: Duration,
    pub typing_ttl: Duration,
    pub presence_grace: Duration,
}

/// The sender a message or typing signal is attributed to.
struct Sender {
    user_id: String,
    user_name: Option<String>,
    user_image: Option<String>,
}

pub struct Dispatcher {
    registry: ConnectionRegistry,
    router: RoomRouter,
    typing: TypingTracker,
    presence: Arc<PresenceRegistry>,
    verifier: IdentityVerifier,
    persist: Option<mpsc::Sender<MessageRecord>>,
}

impl Dispatcher {
    pub fn new(
        verifier: IdentityVerifier,
        presence: Arc<PresenceRegistry>,
        persist: Option<mpsc::Sender<MessageRecord>>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            router: RoomRouter::new(),
            typing: TypingTracker::new(),
            presence,
            verifier,
            persist,
        }
    }

    /// Register a connection and greet it with `ready`.
    pub fn connect(
        &mut self,
        outbound: OutboundSender,
        identity: Option<Identity>,
    ) -> ConnectionId {
        let user_id = identity.as_ref().map(|i| i.user_id.clone());
        let id = self.registry.on_connect(outbound, identity);

        if let Some(user_id) = &user_id {
            if self.presence.set_online(user_id) {
                tracing::debug!(user_id = %user_id, "user online");
            }
        }

        let ready = ReadyPayload {
            connection_id: id,
            user_id,
        };
        self.send_to(id, ServerEvent::Ready(ready));
        id
    }

    /// Tear a connection down. Safe to call for unknown or already-removed ids.
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        self.remove(id, None)
    }

    pub fn touch(&mut self, id: ConnectionId) {
        self.registry.touch(id);
    }

    /// Apply one client event. Errors mean the event was dropped; the caller
    /// logs them and keeps the connection open.
    pub fn handle(&mut self, id: ConnectionId, event: ClientEvent) -> Result<(), EventError> {
        if self.registry.get(id).is_none() {
            // Raced with disconnect or idle reaping.
            return Ok(());
        }
        self.registry.touch(id);

        match event {
            ClientEvent::Identify { token } => self.identify(id, &token),
            ClientEvent::JoinRoom(room) => self.join_room(id, room),
            ClientEvent::LeaveRoom(room) => {
                self.leave_room(id, &room);
                Ok(())
            }
            ClientEvent::SendMessage(draft) => self.send_message(id, draft),
            ClientEvent::Typing(draft) => self.start_typing(id, draft),
        }
    }

    /// Deliver a notification to its target room. Returns how many
    /// connections received it; zero means the user is offline and the
    /// event was dropped.
    pub fn notify(&mut self, event: NotificationEvent) -> usize {
        let delivered = self.broadcast(
            &event.target_room,
            ServerEvent::Notification(event.notification),
            None,
        );
        if delivered == 0 {
            tracing::debug!(room = %event.target_room, "notification dropped, no listeners");
        }
        delivered
    }

    /// Expire typing indicators, take lapsed users offline and close idle
    /// connections.
    pub fn sweep(&mut self, policy: SweepPolicy) {
        for (conn, signal) in self.typing.sweep_expired(policy.typing_ttl) {
            let room = signal.room.clone();
            self.broadcast(&room, ServerEvent::UserStoppedTyping(signal), Some(conn));
        }

        for user_id in self.presence.sweep_offline(policy.presence_grace) {
            tracing::debug!(user_id = %user_id, "user offline");
        }

        for id in self.registry.idle(policy.idle_timeout) {
            tracing::info!(connection_id = %id, "closing idle connection");
            self.remove(id, Some(CloseReason::IdleTimeout));
        }
    }

    /// Close every connection. Used on hub shutdown.
    pub fn close_all(&mut self) {
        for conn in self.registry.drain(&mut self.router) {
            if let Some(user_id) = conn.user_id() {
                self.presence.remove_connection(user_id);
            }
            conn.close(CloseReason::ServerShutdown);
        }
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.len(),
            rooms: self.router.room_count(),
        }
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    fn identify(&mut self, id: ConnectionId, token: &str) -> Result<(), EventError> {
        let event = EventName::IDENTIFY;
        let identity = self
            .verifier
            .verify(token)
            .map_err(|reason| EventError::Forbidden { event, reason })?;
        let user_id = identity.user_id.clone();
        let was_anonymous = self
            .registry
            .get(id)
            .is_some_and(|conn| conn.identity.is_none());

        match self.registry.identify(id, identity) {
            Ok(()) => {}
            Err(IdentifyError::AlreadyIdentified { current }) => {
                return Err(EventError::SenderMismatch {
                    event,
                    claimed: user_id,
                    actual: current,
                });
            }
            Err(IdentifyError::UnknownConnection) => return Ok(()),
        }

        if was_anonymous {
            self.presence.set_online(&user_id);
        }
        tracing::debug!(connection_id = %id, user_id = %user_id, "connection identified");
        let ready = ReadyPayload {
            connection_id: id,
            user_id: Some(user_id),
        };
        self.send_to(id, ServerEvent::Ready(ready));
        Ok(())
    }

    fn join_room(&mut self, id: ConnectionId, room: RoomKey) -> Result<(), EventError> {
        self.authorize_room(id, &room, EventName::JOIN_ROOM)?;
        if self.router.join(id, room.clone()) {
            tracing::debug!(connection_id = %id, room = %room, "joined room");
        }
        Ok(())
    }

    fn leave_room(&mut self, id: ConnectionId, room: &RoomKey) {
        if let Some(signal) = self.typing.stop(room, id) {
            self.broadcast(room, ServerEvent::UserStoppedTyping(signal), Some(id));
        }
        if self.router.leave(id, room) {
            tracing::debug!(connection_id = %id, room = %room, "left room");
        }
    }

    fn send_message(&mut self, id: ConnectionId, draft: MessageDraft) -> Result<(), EventError> {
        let event = EventName::SEND_MESSAGE;
        if draft.room.kind() == RoomKind::Notification {
            return Err(EventError::Forbidden {
                event,
                reason: "chat messages cannot target a notification room",
            });
        }
        self.authorize_room(id, &draft.room, event)?;
        let sender = self.resolve_sender(
            id,
            event,
            draft.user_id,
            draft.user_name,
            draft.user_image,
        )?;

        // The message itself ends this connection's typing indicator.
        self.typing.stop(&draft.room, id);

        let sent_at = Utc::now();
        let message = ChatMessage {
            id: MessageId::generate(),
            room: draft.room,
            user_name: sender.user_name.unwrap_or_else(|| sender.user_id.clone()),
            user_id: sender.user_id,
            user_image: sender.user_image,
            content: draft.content,
            timestamp: sent_at.format(TIMESTAMP_FORMAT).to_string(),
            sent_at,
        };

        let room = message.room.clone();
        let record = MessageRecord {
            id: message.id.clone(),
            room: message.room.clone(),
            sender_id: message.user_id.clone(),
            sender_name: message.user_name.clone(),
            sender_image: message.user_image.clone(),
            content: message.content.clone(),
            sent_at,
        };

        // Sender included: clients reconcile their optimistic echo by id.
        let delivered = self.broadcast(&room, ServerEvent::ReceiveMessage(message), None);
        tracing::debug!(connection_id = %id, room = %room, delivered, "message relayed");

        self.persist(record);
        Ok(())
    }

    fn start_typing(&mut self, id: ConnectionId, draft: TypingDraft) -> Result<(), EventError> {
        let event = EventName::TYPING;
        self.authorize_room(id, &draft.room, event)?;
        let sender = self.resolve_sender(id, event, draft.user_id, None, None)?;

        self.typing.start(draft.room.clone(), id, sender.user_id.clone());
        let signal = TypingSignal {
            room: draft.room,
            user_id: sender.user_id,
        };
        let room = signal.room.clone();
        self.broadcast(&room, ServerEvent::UserTyping(signal), Some(id));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Identified connections may only use rooms they participate in. With
    /// identity tokens enabled, anonymous connections may not listen on
    /// notification rooms.
    fn authorize_room(
        &self,
        id: ConnectionId,
        room: &RoomKey,
        event: &'static str,
    ) -> Result<(), EventError> {
        let user_id = self.registry.get(id).and_then(|c| c.user_id());
        match user_id {
            Some(user_id) if !room.has_participant(user_id) => Err(EventError::Forbidden {
                event,
                reason: "connection is not a participant of this room",
            }),
            None if self.verifier.is_enabled() && room.kind() == RoomKind::Notification => {
                Err(EventError::Forbidden {
                    event,
                    reason: "notification rooms require an identified connection",
                })
            }
            _ => Ok(()),
        }
    }

    fn resolve_sender(
        &self,
        id: ConnectionId,
        event: &'static str,
        claimed: Option<String>,
        user_name: Option<String>,
        user_image: Option<String>,
    ) -> Result<Sender, EventError> {
        let identity = self.registry.get(id).and_then(|c| c.identity.as_ref());
        match (identity, claimed) {
            (Some(identity), Some(claimed)) if claimed != identity.user_id => {
                Err(EventError::SenderMismatch {
                    event,
                    claimed,
                    actual: identity.user_id.clone(),
                })
            }
            (Some(identity), _) => Ok(Sender {
                user_id: identity.user_id.clone(),
                user_name: Some(identity.display_name.clone()),
                user_image: identity.avatar.clone(),
            }),
            (None, Some(claimed)) => Ok(Sender {
                user_id: claimed,
                user_name,
                user_image,
            }),
            (None, None) => Err(EventError::InvalidField {
                event,
                field: "userId",
                reason: "is required".to_string(),
            }),
        }
    }

    /// Write `event` to every member of `room` except `exclude`. Returns how
    /// many queues accepted it.
    fn broadcast(
        &self,
        room: &RoomKey,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let name = event.name();
        let event = Arc::new(event);
        let mut delivered = 0;

        for member in self.router.members(room) {
            if Some(member) == exclude {
                continue;
            }
            let Some(conn) = self.registry.get(member) else {
                continue;
            };
            match conn.deliver(event.clone()) {
                Delivery::Sent => delivered += 1,
                Delivery::Full => {
                    tracing::warn!(
                        connection_id = %member,
                        room = %room,
                        event = name,
                        "outbound queue full, event dropped"
                    );
                }
                Delivery::Closed => {}
            }
        }
        delivered
    }

    fn send_to(&self, id: ConnectionId, event: ServerEvent) {
        if let Some(conn) = self.registry.get(id) {
            if conn.deliver(Arc::new(event)) == Delivery::Full {
                tracing::warn!(connection_id = %id, "outbound queue full, event dropped");
            }
        }
    }

    /// Drop a connection, telling its task why when `reason` is given.
    fn remove(&mut self, id: ConnectionId, reason: Option<CloseReason>) -> bool {
        // Stop typing indicators while room membership is still known.
        for signal in self.typing.clear_connection(id) {
            let room = signal.room.clone();
            self.broadcast(&room, ServerEvent::UserStoppedTyping(signal), Some(id));
        }

        let Some(conn) = self.registry.on_disconnect(id, &mut self.router) else {
            return false;
        };
        if let Some(user_id) = conn.user_id() {
            self.presence.remove_connection(user_id);
        }
        if let Some(reason) = reason {
            conn.close(reason);
        }
        true
    }

    fn persist(&self, record: MessageRecord) {
        let Some(queue) = &self.persist else {
            return;
        };
        match queue.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                tracing::warn!(
                    message_id = %record.id,
                    "persistence queue full, message not stored"
                );
            }
            Err(TrySendError::Closed(record)) => {
                tracing::warn!(
                    message_id = %record.id,
                    "message writer stopped, message not stored"
                );
            }
        }
    }
}

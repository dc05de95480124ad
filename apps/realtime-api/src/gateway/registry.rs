//! Connection registry: identity, outbound queue and liveness of every open
//! gateway connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::OwnedPermit;

use crate::auth::identity::Identity;

use super::events::ServerEvent;
use super::router::RoomRouter;

/// Process-unique connection identifier. Never reused while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why the server is closing a connection from its side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IdleTimeout,
    ServerShutdown,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::IdleTimeout => 4009,
            Self::ServerShutdown => 1001,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::IdleTimeout => "Idle timeout",
            Self::ServerShutdown => "Server shutting down",
        }
    }
}

/// An item on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<ServerEvent>),
    Close(CloseReason),
}

pub type OutboundSender = mpsc::Sender<Outbound>;
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

/// Result of writing one event to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The connection is not draining its queue fast enough; event dropped.
    Full,
    /// The connection task is gone; its disconnect is already in flight.
    Closed,
}

/// One live transport session.
pub struct Connection {
    pub id: ConnectionId,
    /// `None` until the connection identifies.
    pub identity: Option<Identity>,
    outbound: OutboundSender,
    /// Queue slot held back for the close frame, so a reaped slow consumer
    /// still learns why it was dropped.
    close_slot: Option<OwnedPermit<Outbound>>,
    last_seen: Instant,
}

impl Connection {
    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.user_id.as_str())
    }

    /// Queue an event without waiting.
    pub fn deliver(&self, event: Arc<ServerEvent>) -> Delivery {
        match self.outbound.try_send(Outbound::Event(event)) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Ask the connection task to close. Uses the reserved slot when there
    /// is one, so the reason survives a full queue.
    pub fn close(self, reason: CloseReason) {
        match self.close_slot {
            Some(slot) => {
                slot.send(Outbound::Close(reason));
            }
            None => {
                let _ = self.outbound.try_send(Outbound::Close(reason));
            }
        }
    }
}

/// Identity changes the registry refuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifyError {
    UnknownConnection,
    AlreadyIdentified { current: String },
}

/// All live connections, keyed by id. Owned by the hub task.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: u64,
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection and allocate its id. Always succeeds.
    ///
    /// One slot of `outbound` is reserved for the close frame; size the
    /// queue one larger than the event backlog it should hold.
    pub fn on_connect(
        &mut self,
        outbound: OutboundSender,
        identity: Option<Identity>,
    ) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let close_slot = outbound.clone().try_reserve_owned().ok();
        self.connections.insert(
            id,
            Connection {
                id,
                identity,
                outbound,
                close_slot,
                last_seen: Instant::now(),
            },
        );
        id
    }

    /// Remove a connection from every room, then discard its record.
    ///
    /// Membership is pruned before the record is dropped so no broadcast can
    /// resolve to a dead handle. Unknown ids are a no-op.
    pub fn on_disconnect(
        &mut self,
        id: ConnectionId,
        router: &mut RoomRouter,
    ) -> Option<Connection> {
        router.remove_connection(id);
        self.connections.remove(&id)
    }

    /// Attach an identity to a connection.
    ///
    /// Re-identifying as the same user refreshes the display fields;
    /// switching to a different user is refused.
    pub fn identify(&mut self, id: ConnectionId, identity: Identity) -> Result<(), IdentifyError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(IdentifyError::UnknownConnection)?;
        if let Some(current) = &conn.identity {
            if current.user_id != identity.user_id {
                return Err(IdentifyError::AlreadyIdentified {
                    current: current.user_id.clone(),
                });
            }
        }
        conn.identity = Some(identity);
        Ok(())
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Record inbound activity.
    pub fn touch(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.last_seen = Instant::now();
        }
    }

    /// Connections with no activity for longer than `timeout`.
    pub fn idle(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.connections
            .values()
            .filter(|c| now.duration_since(c.last_seen) > timeout)
            .map(|c| c.id)
            .collect()
    }

    /// Drop every record, returning them so the caller can close them.
    pub fn drain(&mut self, router: &mut RoomRouter) -> Vec<Connection> {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.on_disconnect(id, router))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use hearth_common::RoomKey;

    use super::*;
    use crate::gateway::events::ReadyPayload;

    fn identity(user_id: &str) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            display_name: user_id.to_uppercase(),
            avatar: None,
        }
    }

    fn outbound() -> (OutboundSender, OutboundReceiver) {
        mpsc::channel(4)
    }

    #[test]
    fn on_connect_allocates_distinct_ids() {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = outbound();
        let a = registry.on_connect(tx.clone(), None);
        let b = registry.on_connect(tx, None);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(a).unwrap().identity.is_none());
    }

    #[test]
    fn on_disconnect_prunes_rooms_and_is_idempotent() {
        let mut registry = ConnectionRegistry::new();
        let mut router = RoomRouter::new();
        let (tx, _rx) = outbound();
        let id = registry.on_connect(tx, None);
        let room = RoomKey::parse("u1_u2").unwrap();
        router.join(id, room.clone());

        assert!(registry.on_disconnect(id, &mut router).is_some());
        assert_eq!(router.rooms_of(id).count(), 0);
        assert_eq!(router.members_of(&room).len(), 0);
        assert!(registry.get(id).is_none());

        // Second call and unknown ids are no-ops.
        assert!(registry.on_disconnect(id, &mut router).is_none());
        assert!(registry
            .on_disconnect(ConnectionId(9999), &mut router)
            .is_none());
    }

    #[test]
    fn ids_are_not_reused_after_disconnect() {
        let mut registry = ConnectionRegistry::new();
        let mut router = RoomRouter::new();
        let (tx, _rx) = outbound();
        let first = registry.on_connect(tx.clone(), None);
        registry.on_disconnect(first, &mut router);
        let second = registry.on_connect(tx, None);
        assert_ne!(first, second);
    }

    #[test]
    fn identify_refuses_switching_users() {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = outbound();
        let id = registry.on_connect(tx, None);

        registry.identify(id, identity("u1")).unwrap();
        assert_eq!(registry.get(id).unwrap().user_id(), Some("u1"));

        // Same user again is fine.
        registry.identify(id, identity("u1")).unwrap();

        let err = registry.identify(id, identity("u2")).unwrap_err();
        assert_eq!(
            err,
            IdentifyError::AlreadyIdentified {
                current: "u1".to_string()
            }
        );
        assert_eq!(
            registry.identify(ConnectionId(42), identity("u1")),
            Err(IdentifyError::UnknownConnection)
        );
    }

    #[test]
    fn idle_lists_connections_past_timeout() {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = outbound();
        let stale = registry.on_connect(tx.clone(), None);
        let fresh = registry.on_connect(tx, None);

        registry.connections.get_mut(&stale).unwrap().last_seen =
            Instant::now() - Duration::from_secs(600);

        let idle = registry.idle(Duration::from_secs(120));
        assert_eq!(idle, vec![stale]);

        registry.touch(stale);
        assert!(registry.idle(Duration::from_secs(120)).is_empty());
        assert!(registry.get(fresh).is_some());
    }

    #[test]
    fn deliver_reports_full_and_closed_queues() {
        let mut registry = ConnectionRegistry::new();
        // One event slot plus the close slot.
        let (tx, rx) = mpsc::channel(2);
        let id = registry.on_connect(tx, None);
        let conn = registry.get(id).unwrap();
        let event = Arc::new(ServerEvent::Ready(ReadyPayload {
            connection_id: id,
            user_id: None,
        }));

        assert_eq!(conn.deliver(event.clone()), Delivery::Sent);
        assert_eq!(conn.deliver(event.clone()), Delivery::Full);
        drop(rx);
        assert_eq!(conn.deliver(event), Delivery::Closed);
    }

    #[test]
    fn close_reason_survives_a_full_queue() {
        let mut registry = ConnectionRegistry::new();
        let mut router = RoomRouter::new();
        let (tx, mut rx) = mpsc::channel(3);
        let id = registry.on_connect(tx, None);
        let event = Arc::new(ServerEvent::Ready(ReadyPayload {
            connection_id: id,
            user_id: None,
        }));

        let conn = registry.get(id).unwrap();
        assert_eq!(conn.deliver(event.clone()), Delivery::Sent);
        assert_eq!(conn.deliver(event.clone()), Delivery::Sent);
        assert_eq!(conn.deliver(event), Delivery::Full);

        registry
            .on_disconnect(id, &mut router)
            .unwrap()
            .close(CloseReason::IdleTimeout);

        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        assert_eq!(items.len(), 3);
        assert!(matches!(
            items.last(),
            Some(Outbound::Close(CloseReason::IdleTimeout))
        ));
    }
}

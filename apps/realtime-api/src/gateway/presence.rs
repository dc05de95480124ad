//! Presence tracking: per-user online/offline and per-room typing transience.
//!
//! Presence is per-**user**, not per-connection. A user is only considered
//! offline when ALL of their identified connections have closed and the grace
//! period has passed. The hub task is the only writer; HTTP handlers read the
//! registry concurrently, which is why it sits behind a `DashMap`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hearth_common::RoomKey;
use serde::Serialize;
use utoipa::ToSchema;

use super::events::TypingSignal;
use super::registry::ConnectionId;

/// Offline entries older than this are forgotten entirely.
const OFFLINE_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Per-user presence state.
struct UserPresence {
    status: PresenceStatus,
    /// Number of open identified connections for this user.
    connection_count: usize,
    /// When the last status change occurred.
    updated_at: Instant,
    /// Set when `connection_count` drops to 0; cleared on reconnect.
    disconnected_at: Option<Instant>,
}

/// Thread-safe, DashMap-backed presence registry.
#[derive(Default)]
pub struct PresenceRegistry {
    inner: DashMap<String, UserPresence>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection coming online and clear any pending offline
    /// transition.
    ///
    /// Returns `true` if the user was not online before.
    pub fn set_online(&self, user_id: &str) -> bool {
        let mut entry = self
            .inner
            .entry(user_id.to_string())
            .or_insert_with(|| UserPresence {
                status: PresenceStatus::Offline,
                connection_count: 0,
                updated_at: Instant::now(),
                disconnected_at: None,
            });

        let was_offline = entry.status == PresenceStatus::Offline;
        entry.connection_count += 1;
        entry.disconnected_at = None;
        if was_offline {
            entry.status = PresenceStatus::Online;
            entry.updated_at = Instant::now();
        }
        was_offline
    }

    /// Decrement the connection count. When it reaches 0 the sweeper takes
    /// the user offline after the grace period.
    pub fn remove_connection(&self, user_id: &str) {
        if let Some(mut entry) = self.inner.get_mut(user_id) {
            entry.connection_count = entry.connection_count.saturating_sub(1);
            if entry.connection_count == 0 {
                entry.disconnected_at = Some(Instant::now());
            }
        }
    }

    /// Take users whose grace period expired offline and forget long-offline
    /// entries. Returns the users that just went offline.
    pub fn sweep_offline(&self, grace_period: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut gone_offline = Vec::new();

        self.inner.retain(|user_id, presence| {
            if presence.connection_count > 0 {
                return true;
            }
            if let Some(disc_at) = presence.disconnected_at {
                if now.duration_since(disc_at) > grace_period
                    && presence.status == PresenceStatus::Online
                {
                    presence.status = PresenceStatus::Offline;
                    presence.disconnected_at = None;
                    presence.updated_at = now;
                    gone_offline.push(user_id.clone());
                }
            }
            !(presence.status == PresenceStatus::Offline
                && now.duration_since(presence.updated_at) > OFFLINE_RETENTION)
        });

        gone_offline
    }

    /// Current status; untracked users are offline.
    pub fn status(&self, user_id: &str) -> PresenceStatus {
        self.inner
            .get(user_id)
            .map(|e| e.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.inner
            .get(user_id)
            .map(|e| e.connection_count)
            .unwrap_or(0)
    }
}

/// Who is typing where. Owned by the hub task.
///
/// Keyed by connection rather than user so a user typing in two tabs does
/// not suppress the other tab's signal.
#[derive(Default)]
pub struct TypingTracker {
    active: HashMap<(RoomKey, ConnectionId), (String, Instant)>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a typing event. Returns `true` if the connection was not
    /// already typing in this room.
    pub fn start(&mut self, room: RoomKey, conn: ConnectionId, user_id: String) -> bool {
        self.active
            .insert((room, conn), (user_id, Instant::now()))
            .is_none()
    }

    /// Clear one indicator, returning the signal that was active.
    pub fn stop(&mut self, room: &RoomKey, conn: ConnectionId) -> Option<TypingSignal> {
        self.active
            .remove(&(room.clone(), conn))
            .map(|(user_id, _)| TypingSignal {
                room: room.clone(),
                user_id,
            })
    }

    /// Clear every indicator held by `conn`.
    pub fn clear_connection(&mut self, conn: ConnectionId) -> Vec<TypingSignal> {
        let keys: Vec<(RoomKey, ConnectionId)> = self
            .active
            .keys()
            .filter(|(_, c)| *c == conn)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|(room, c)| self.stop(&room, c))
            .collect()
    }

    /// Remove indicators older than `ttl`.
    pub fn sweep_expired(&mut self, ttl: Duration) -> Vec<(ConnectionId, TypingSignal)> {
        let now = Instant::now();
        let expired: Vec<(RoomKey, ConnectionId)> = self
            .active
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) > ttl)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|(room, conn)| self.stop(&room, conn).map(|signal| (conn, signal)))
            .collect()
    }

    #[cfg(test)]
    fn is_typing(&self, room: &RoomKey, conn: ConnectionId) -> bool {
        self.active.contains_key(&(room.clone(), conn))
    }
}

#[cfg(test)]
mod tests {
    use crate::gateway::registry::ConnectionRegistry;

    use super::*;

    fn room(key: &str) -> RoomKey {
        RoomKey::parse(key).unwrap()
    }

    fn connections(n: usize) -> Vec<ConnectionId> {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        (0..n).map(|_| registry.on_connect(tx.clone(), None)).collect()
    }

    #[test]
    fn set_online_reports_first_connection_only() {
        let reg = PresenceRegistry::new();
        assert!(reg.set_online("u1"));
        assert!(!reg.set_online("u1"));
        assert_eq!(reg.status("u1"), PresenceStatus::Online);
        assert_eq!(reg.connection_count("u1"), 2);
    }

    #[test]
    fn unknown_user_is_offline() {
        let reg = PresenceRegistry::new();
        assert_eq!(reg.status("ghost"), PresenceStatus::Offline);
        assert_eq!(reg.connection_count("ghost"), 0);
    }

    #[test]
    fn multi_connection_no_offline_until_all_disconnect() {
        let reg = PresenceRegistry::new();
        reg.set_online("u1");
        reg.set_online("u1");

        reg.remove_connection("u1");
        assert!(reg.sweep_offline(Duration::ZERO).is_empty());
        assert_eq!(reg.status("u1"), PresenceStatus::Online);

        reg.remove_connection("u1");
        let gone = reg.sweep_offline(Duration::ZERO);
        assert_eq!(gone, vec!["u1".to_string()]);
        assert_eq!(reg.status("u1"), PresenceStatus::Offline);
    }

    #[test]
    fn grace_period_reconnect_cancels_offline() {
        let reg = PresenceRegistry::new();
        reg.set_online("u1");
        reg.remove_connection("u1");

        // Reconnect before the sweep runs.
        assert!(!reg.set_online("u1"));
        assert!(reg.sweep_offline(Duration::ZERO).is_empty());
        assert_eq!(reg.status("u1"), PresenceStatus::Online);
    }

    #[test]
    fn sweep_respects_grace_period() {
        let reg = PresenceRegistry::new();
        reg.set_online("u1");
        reg.remove_connection("u1");

        assert!(reg.sweep_offline(Duration::from_secs(30)).is_empty());
        assert_eq!(reg.status("u1"), PresenceStatus::Online);

        assert_eq!(reg.sweep_offline(Duration::ZERO).len(), 1);
        // Already offline: not reported twice.
        assert!(reg.sweep_offline(Duration::ZERO).is_empty());
    }

    #[test]
    fn sweep_forgets_stale_offline_entries() {
        let reg = PresenceRegistry::new();
        reg.set_online("u1");
        reg.remove_connection("u1");
        reg.sweep_offline(Duration::ZERO);

        reg.inner.get_mut("u1").unwrap().updated_at = Instant::now() - Duration::from_secs(360);

        reg.sweep_offline(Duration::ZERO);
        assert!(reg.inner.get("u1").is_none());
    }

    #[test]
    fn typing_start_stop() {
        let mut typing = TypingTracker::new();
        let c = connections(1)[0];

        assert!(typing.start(room("u1_u2"), c, "u1".to_string()));
        assert!(!typing.start(room("u1_u2"), c, "u1".to_string()));
        assert!(typing.is_typing(&room("u1_u2"), c));

        let signal = typing.stop(&room("u1_u2"), c).unwrap();
        assert_eq!(signal.user_id, "u1");
        assert!(typing.stop(&room("u1_u2"), c).is_none());
    }

    #[test]
    fn typing_clear_connection_only_touches_that_connection() {
        let mut typing = TypingTracker::new();
        let ids = connections(2);
        typing.start(room("u1_u2"), ids[0], "u1".to_string());
        typing.start(room("u1_u3"), ids[0], "u1".to_string());
        typing.start(room("u1_u2"), ids[1], "u2".to_string());

        let cleared = typing.clear_connection(ids[0]);
        assert_eq!(cleared.len(), 2);
        assert!(typing.is_typing(&room("u1_u2"), ids[1]));
    }

    #[test]
    fn typing_sweep_expires_old_indicators() {
        let mut typing = TypingTracker::new();
        let ids = connections(2);
        typing.start(room("u1_u2"), ids[0], "u1".to_string());
        typing.start(room("u1_u2"), ids[1], "u2".to_string());

        typing
            .active
            .get_mut(&(room("u1_u2"), ids[0]))
            .unwrap()
            .1 = Instant::now() - Duration::from_secs(10);

        let expired = typing.sweep_expired(Duration::from_secs(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, ids[0]);
        assert_eq!(expired[0].1.user_id, "u1");
        assert!(typing.is_typing(&room("u1_u2"), ids[1]));
    }
}

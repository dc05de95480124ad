//! Room router: the room → members and member → rooms tables.
//!
//! These two maps are the only shared mutable state of the gateway. They are
//! mutated through `join`, `leave` and `remove_connection` only, and kept
//! mirror-consistent by each of those calls. A room is reaped as soon as its
//! last member leaves.

use std::collections::{HashMap, HashSet};

use hearth_common::RoomKey;

use super::registry::ConnectionId;

#[derive(Default)]
pub struct RoomRouter {
    rooms: HashMap<RoomKey, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<RoomKey>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room`, creating the room if needed.
    ///
    /// Returns `false` if the connection was already a member.
    pub fn join(&mut self, conn: ConnectionId, room: RoomKey) -> bool {
        let inserted = self.rooms.entry(room.clone()).or_default().insert(conn);
        if inserted {
            self.memberships.entry(conn).or_default().insert(room);
        }
        inserted
    }

    /// Remove `conn` from `room`. Deletes the room once it is empty.
    ///
    /// Returns `false` if the connection was not a member.
    pub fn leave(&mut self, conn: ConnectionId, room: &RoomKey) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(members) => {
                let removed = members.remove(&conn);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
                removed
            }
            None => false,
        };

        if let Some(rooms) = self.memberships.get_mut(&conn) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.memberships.remove(&conn);
            }
        }
        removed
    }

    /// Remove `conn` from every room it joined. Returns the rooms it left.
    pub fn remove_connection(&mut self, conn: ConnectionId) -> Vec<RoomKey> {
        let Some(rooms) = self.memberships.remove(&conn) else {
            return Vec::new();
        };

        for room in &rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&conn);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        rooms.into_iter().collect()
    }

    /// Snapshot of a room's members. Empty for unknown rooms.
    pub fn members_of(&self, room: &RoomKey) -> HashSet<ConnectionId> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    /// Iterate a room's members without copying the set.
    pub fn members<'a>(&'a self, room: &RoomKey) -> impl Iterator<Item = ConnectionId> + 'a {
        self.rooms
            .get(room)
            .into_iter()
            .flat_map(|members| members.iter().copied())
    }

    pub fn rooms_of(&self, conn: ConnectionId) -> impl Iterator<Item = &RoomKey> + '_ {
        self.memberships
            .get(&conn)
            .into_iter()
            .flat_map(|rooms| rooms.iter())
    }

    pub fn is_member(&self, conn: ConnectionId, room: &RoomKey) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(&conn))
    }

    /// Number of rooms with at least one member.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::gateway::registry::ConnectionRegistry;

    use super::*;

    fn room(key: &str) -> RoomKey {
        RoomKey::parse(key).unwrap()
    }

    /// Allocate real connection ids through the registry.
    fn connections(n: usize) -> Vec<ConnectionId> {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        (0..n).map(|_| registry.on_connect(tx.clone(), None)).collect()
    }

    #[test]
    fn join_is_idempotent() {
        let mut router = RoomRouter::new();
        let c = connections(1)[0];

        assert!(router.join(c, room("u1_u2")));
        assert!(!router.join(c, room("u1_u2")));

        assert_eq!(router.members_of(&room("u1_u2")).len(), 1);
        assert_eq!(router.rooms_of(c).count(), 1);
    }

    #[test]
    fn members_of_unknown_room_is_empty() {
        let router = RoomRouter::new();
        assert!(router.members_of(&room("nobody_here")).is_empty());
        assert_eq!(router.members(&room("nobody_here")).count(), 0);
    }

    #[test]
    fn leave_reaps_empty_rooms() {
        let mut router = RoomRouter::new();
        let ids = connections(2);
        let (a, b) = (ids[0], ids[1]);

        router.join(a, room("u1_u2"));
        router.join(b, room("u1_u2"));
        assert_eq!(router.room_count(), 1);

        assert!(router.leave(a, &room("u1_u2")));
        assert_eq!(router.room_count(), 1);
        assert!(router.leave(b, &room("u1_u2")));
        assert_eq!(router.room_count(), 0);

        // Leaving again or leaving an unknown room is harmless.
        assert!(!router.leave(b, &room("u1_u2")));
        assert!(!router.leave(b, &room("never_joined")));
    }

    #[test]
    fn remove_connection_clears_both_tables() {
        let mut router = RoomRouter::new();
        let ids = connections(2);
        let (a, b) = (ids[0], ids[1]);

        router.join(a, room("u1_u2"));
        router.join(a, room("user-u1"));
        router.join(b, room("u1_u2"));

        let mut left = router.remove_connection(a);
        left.sort();
        assert_eq!(left, vec![room("u1_u2"), room("user-u1")]);

        assert_eq!(router.rooms_of(a).count(), 0);
        assert!(!router.is_member(a, &room("u1_u2")));
        assert!(router.is_member(b, &room("u1_u2")));
        // user-u1 had only `a`, so it is gone.
        assert_eq!(router.room_count(), 1);

        assert!(router.remove_connection(a).is_empty());
    }

    #[test]
    fn tables_stay_mirrored() {
        let mut router = RoomRouter::new();
        let ids = connections(3);
        let rooms = [room("a_b"), room("a_c"), room("user-a")];

        for (i, c) in ids.iter().enumerate() {
            for r in rooms.iter().skip(i) {
                router.join(*c, r.clone());
            }
        }
        router.leave(ids[0], &rooms[1]);
        router.remove_connection(ids[1]);

        for r in &rooms {
            for c in router.members(r) {
                assert!(router.rooms_of(c).any(|joined| joined == r));
            }
        }
        for c in &ids {
            for r in router.rooms_of(*c) {
                assert!(router.is_member(*c, r));
            }
        }
    }
}

//! Room keys and their derivation.
//!
//! Every party that names a room (the realtime gateway, the bridge, the
//! messaging UI, the persistence layer) must derive keys through this module.
//! If two callers disagree on a conversation key, their messages land in two
//! different rooms without any error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Joins the two sorted participant ids of a conversation room.
pub const CONVERSATION_SEPARATOR: char = '_';

/// Prefix of a user's private notification room.
pub const NOTIFICATION_PREFIX: &str = "user-";

/// Longest room key accepted from a client.
pub const MAX_ROOM_KEY_LEN: usize = 128;

/// The two kinds of room the gateway routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    /// Two-party chat room keyed by the sorted participant pair.
    Conversation,
    /// A single user's out-of-band channel (likes, comments, invites).
    Notification,
}

/// Reasons a raw string is not a usable room key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomKeyError {
    Empty,
    TooLong(usize),
    InvalidCharacter(char),
}

impl fmt::Display for RoomKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("room key is empty"),
            Self::TooLong(len) => {
                write!(f, "room key is {len} chars, limit is {MAX_ROOM_KEY_LEN}")
            }
            Self::InvalidCharacter(c) => write!(f, "room key contains invalid character {c:?}"),
        }
    }
}

impl std::error::Error for RoomKeyError {}

/// Identifier of a logical broadcast group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomKey(String);

impl RoomKey {
    /// Validate a client-supplied key.
    pub fn parse(raw: &str) -> Result<Self, RoomKeyError> {
        if raw.is_empty() {
            return Err(RoomKeyError::Empty);
        }
        let len = raw.chars().count();
        if len > MAX_ROOM_KEY_LEN {
            return Err(RoomKeyError::TooLong(len));
        }
        if let Some(c) = raw.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(RoomKeyError::InvalidCharacter(c));
        }
        Ok(Self(raw.to_string()))
    }

    /// Conversation room between two users. Argument order does not matter.
    pub fn conversation(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}{CONVERSATION_SEPARATOR}{second}"))
    }

    /// Private notification room of a single user.
    pub fn notification(user_id: &str) -> Self {
        Self(format!("{NOTIFICATION_PREFIX}{user_id}"))
    }

    pub fn kind(&self) -> RoomKind {
        if self.0.starts_with(NOTIFICATION_PREFIX) {
            RoomKind::Notification
        } else {
            RoomKind::Conversation
        }
    }

    /// The user owning this notification room, if it is one.
    pub fn notification_owner(&self) -> Option<&str> {
        self.0
            .strip_prefix(NOTIFICATION_PREFIX)
            .filter(|user_id| !user_id.is_empty())
    }

    /// Whether `user_id` belongs in this room: the owner of a notification
    /// room, or one of the two participants of a conversation room.
    ///
    /// Ids containing [`CONVERSATION_SEPARATOR`] never participate in a
    /// conversation, since the key could not tell them apart from a
    /// different pair.
    pub fn has_participant(&self, user_id: &str) -> bool {
        if let Some(owner) = self.notification_owner() {
            return owner == user_id;
        }
        if !is_participant_id(user_id) {
            return false;
        }
        let as_first = self
            .0
            .strip_prefix(user_id)
            .and_then(|rest| rest.strip_prefix(CONVERSATION_SEPARATOR))
            .is_some_and(|other| is_participant_id(other) && user_id <= other);
        let as_second = self
            .0
            .strip_suffix(user_id)
            .and_then(|rest| rest.strip_suffix(CONVERSATION_SEPARATOR))
            .is_some_and(|other| is_participant_id(other) && other <= user_id);
        as_first || as_second
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomKey {
    type Err = RoomKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomKey {
    type Error = RoomKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomKey> for String {
    fn from(key: RoomKey) -> Self {
        key.0
    }
}

/// Whether `user_id` can name one side of a conversation key.
pub fn is_participant_id(user_id: &str) -> bool {
    !user_id.is_empty() && !user_id.contains(CONVERSATION_SEPARATOR)
}

/// Key of the conversation room between `a` and `b`.
pub fn conversation_key(a: &str, b: &str) -> RoomKey {
    RoomKey::conversation(a, b)
}

/// Key of `user_id`'s notification room.
pub fn notification_room(user_id: &str) -> RoomKey {
    RoomKey::notification(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_is_symmetric() {
        let pairs = [
            ("u1", "u2"),
            ("alice", "bob"),
            ("b", "a"),
            ("same", "same"),
            ("usr_01J0", "usr_01H9"),
            ("", "x"),
        ];
        for (a, b) in pairs {
            assert_eq!(conversation_key(a, b), conversation_key(b, a), "{a} / {b}");
        }
    }

    #[test]
    fn conversation_key_sorts_lexicographically() {
        assert_eq!(conversation_key("u2", "u1").as_str(), "u1_u2");
        assert_eq!(conversation_key("bob", "alice").as_str(), "alice_bob");
        // Byte order, not numeric order.
        assert_eq!(conversation_key("u10", "u9").as_str(), "u10_u9");
    }

    #[test]
    fn notification_room_uses_prefix() {
        let key = notification_room("u3");
        assert_eq!(key.as_str(), "user-u3");
        assert_eq!(key.kind(), RoomKind::Notification);
        assert_eq!(key.notification_owner(), Some("u3"));
    }

    #[test]
    fn conversation_room_has_no_owner() {
        let key = conversation_key("u1", "u2");
        assert_eq!(key.kind(), RoomKind::Conversation);
        assert!(key.notification_owner().is_none());
    }

    #[test]
    fn has_participant_matches_derivation() {
        let key = conversation_key("u2", "u1");
        assert!(key.has_participant("u1"));
        assert!(key.has_participant("u2"));
        assert!(!key.has_participant("u3"));
        assert!(!key.has_participant("u"));

        let own = notification_room("u3");
        assert!(own.has_participant("u3"));
        assert!(!own.has_participant("u1"));

        // Keys not produced by the derivation admit nobody by position alone.
        let unsorted = RoomKey::parse("u2_u1").unwrap();
        assert!(!unsorted.has_participant("u1"));
        assert!(!unsorted.has_participant("u2"));
    }

    #[test]
    fn separator_in_user_id_is_never_a_participant() {
        // "a_b" + "c" and "a" + "b_c" would share the key "a_b_c".
        let key = conversation_key("a_b", "c");
        assert_eq!(key.as_str(), "a_b_c");
        assert!(!key.has_participant("a"));
        assert!(!key.has_participant("a_b"));
        assert!(!key.has_participant("b_c"));
        assert!(!key.has_participant("c"));

        assert!(!is_participant_id("a_b"));
        assert!(!is_participant_id(""));
        assert!(is_participant_id("u1"));
    }

    #[test]
    fn parse_rejects_bad_keys() {
        assert_eq!(RoomKey::parse(""), Err(RoomKeyError::Empty));
        assert_eq!(
            RoomKey::parse("a b"),
            Err(RoomKeyError::InvalidCharacter(' '))
        );
        let long = "x".repeat(MAX_ROOM_KEY_LEN + 1);
        assert_eq!(
            RoomKey::parse(&long),
            Err(RoomKeyError::TooLong(MAX_ROOM_KEY_LEN + 1))
        );
        assert!(RoomKey::parse("u1_u2").is_ok());
    }

    #[test]
    fn deserialize_validates() {
        let ok: RoomKey = serde_json::from_str("\"u1_u2\"").unwrap();
        assert_eq!(ok.as_str(), "u1_u2");
        assert!(serde_json::from_str::<RoomKey>("\"\"").is_err());
    }
}

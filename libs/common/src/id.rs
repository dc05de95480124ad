use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = hearth_common::id::prefixed_ulid("msg");
/// assert!(id.starts_with("msg_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const MESSAGE: &str = "msg";
}

/// Server-assigned identifier of a relayed chat message.
///
/// Clients use it to reconcile their optimistic local echo with the copy the
/// server broadcasts back, and the persistence path stores it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(prefixed_ulid(prefix::MESSAGE))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

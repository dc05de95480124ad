pub mod id;
pub mod room;

pub use id::MessageId;
pub use room::{RoomKey, RoomKeyError, RoomKind};

//! Realtime gateway: WebSocket connections, rooms and event fan-out.

pub mod bridge;
pub mod dispatcher;
pub mod events;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod router;
pub mod server;

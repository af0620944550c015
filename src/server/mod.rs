//! Server side: listener, connection registry, and per-session loop.

pub mod core;
pub mod registry;
pub mod session;

pub use self::core::RoomcastServer;
pub use registry::{ConnectionId, ConnectionRegistry};

//! Client side: reconnecting connection, request correlation, rooms.

pub mod core;
mod pending;
pub mod reconnect;

pub use self::core::{ConnectionState, RoomcastClient};
pub use reconnect::BackoffPolicy;

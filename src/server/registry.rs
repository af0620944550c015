//! Connection registry and room broadcaster.
//!
//! One [`ConnectionRegistry`] per server holds every live connection's
//! outbound queue and the room membership maps. Both maps live behind a
//! single lock so a connection can never be half-removed: whoever holds a
//! member list observed it complete.
//!
//! Delivery is queue-and-forget: envelopes are encoded once and
//! `try_send`-ed into each member's bounded outbound buffer. A full or
//! closed buffer drops that one delivery, logged and counted, and the
//! fan-out moves on.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::auth::Claims;
use crate::error::RoomcastError;
use crate::metrics::MetricsSink;
use crate::protocol::{Envelope, codec};

/// Type-safe connection identifier.
///
/// Wraps a UUID v4. Generated when the socket is accepted and immutable
/// for the connection's lifetime. Used as the registry key and as the
/// `connection_id` field on every session log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Creates a new random `ConnectionId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Creates a `ConnectionId` from an existing [`uuid::Uuid`].
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<uuid::Uuid> for ConnectionId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}

impl From<ConnectionId> for uuid::Uuid {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    sender: mpsc::Sender<Message>,
    identity: Option<Claims>,
    rooms: HashSet<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Shared registry of live connections and their room memberships.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    max_connections: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl ConnectionRegistry {
    /// Creates a registry capped at `max_connections`.
    #[must_use]
    pub fn new(max_connections: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            max_connections,
            metrics,
        }
    }

    /// Adds a connection with its outbound queue.
    ///
    /// # Errors
    ///
    /// Returns [`RoomcastError::Capacity`] when the registry already holds
    /// `max_connections` entries.
    pub async fn register(
        &self,
        id: ConnectionId,
        sender: mpsc::Sender<Message>,
    ) -> Result<(), RoomcastError> {
        let mut inner = self.inner.write().await;
        if inner.connections.len() >= self.max_connections {
            return Err(RoomcastError::Capacity {
                max: self.max_connections,
            });
        }
        inner.connections.insert(
            id,
            ConnectionEntry {
                sender,
                identity: None,
                rooms: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Records the verified identity of a connection after the auth
    /// handshake.
    pub async fn set_identity(&self, id: ConnectionId, claims: Claims) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.connections.get_mut(&id) {
            entry.identity = Some(claims);
        } else {
            warn!(connection_id = %id, "set_identity on unknown connection");
        }
    }

    /// Removes a connection, dropping it from every room it joined.
    /// Returns false when the id was not registered.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.remove(&id) else {
            return false;
        };
        for room in &entry.rooms {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }
        true
    }

    /// Joins a connection to a room. A connection may be in any number of
    /// rooms; joining twice is a no-op. Returns false for unknown ids.
    pub async fn join(&self, id: ConnectionId, room: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(&id) else {
            warn!(connection_id = %id, room, "join from unknown connection");
            return false;
        };
        entry.rooms.insert(room.to_owned());
        inner.rooms.entry(room.to_owned()).or_default().insert(id);
        true
    }

    /// Removes a connection from a room. Leaving a room it never joined
    /// is a no-op. Returns false for unknown ids.
    pub async fn leave(&self, id: ConnectionId, room: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(&id) else {
            return false;
        };
        entry.rooms.remove(room);
        if let Some(members) = inner.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                inner.rooms.remove(room);
            }
        }
        true
    }

    /// Removes a connection from every room. Returns how many rooms it
    /// left.
    pub async fn leave_all(&self, id: ConnectionId) -> usize {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(&id) else {
            return 0;
        };
        let rooms: Vec<String> = entry.rooms.drain().collect();
        for room in &rooms {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }
        rooms.len()
    }

    /// Fans an envelope out to every member of `room`, stamping the
    /// envelope with the room name. Returns the number of deliveries
    /// queued; failures to individual members are dropped, logged, and
    /// counted, never propagated.
    pub async fn broadcast(&self, room: &str, envelope: Envelope) -> usize {
        let started = Instant::now();
        let envelope = envelope.with_room(room);
        let kind = envelope.kind.as_str();
        let message = match codec::encode(&envelope) {
            Ok(text) => Message::Text(text.into()),
            Err(err) => {
                warn!(room, error = %err, "broadcast envelope failed to encode");
                return 0;
            }
        };

        let targets: Vec<(ConnectionId, mpsc::Sender<Message>)> = {
            let inner = self.inner.read().await;
            inner.rooms.get(room).map_or_else(Vec::new, |members| {
                members
                    .iter()
                    .filter_map(|id| {
                        inner
                            .connections
                            .get(id)
                            .map(|entry| (*id, entry.sender.clone()))
                    })
                    .collect()
            })
        };

        let mut delivered = 0;
        for (id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.on_message_sent(kind);
                }
                Err(err) => {
                    warn!(connection_id = %id, room, error = %err, "dropping broadcast delivery");
                    self.metrics.on_message_error("delivery_dropped");
                }
            }
        }
        self.metrics.on_broadcast(room, delivered, started.elapsed());
        debug!(room, delivered, "broadcast complete");
        delivered
    }

    /// Queues an envelope to one connection. Unknown ids are a no-op with
    /// a logged warning; returns whether the delivery was queued.
    pub async fn send_to_connection(&self, id: ConnectionId, envelope: Envelope) -> bool {
        let kind = envelope.kind.as_str();
        let message = match codec::encode(&envelope) {
            Ok(text) => Message::Text(text.into()),
            Err(err) => {
                warn!(connection_id = %id, error = %err, "envelope failed to encode");
                return false;
            }
        };
        let sender = {
            let inner = self.inner.read().await;
            let Some(entry) = inner.connections.get(&id) else {
                warn!(connection_id = %id, "send to unknown connection");
                return false;
            };
            entry.sender.clone()
        };
        match sender.try_send(message) {
            Ok(()) => {
                self.metrics.on_message_sent(kind);
                true
            }
            Err(err) => {
                warn!(connection_id = %id, error = %err, "dropping directed delivery");
                self.metrics.on_message_error("delivery_dropped");
                false
            }
        }
    }

    /// Queues a close frame to every connection. Returns how many were
    /// reached. Used by graceful shutdown.
    pub async fn close_all(&self) -> usize {
        let senders: Vec<mpsc::Sender<Message>> = {
            let inner = self.inner.read().await;
            inner
                .connections
                .values()
                .map(|entry| entry.sender.clone())
                .collect()
        };
        let mut reached = 0;
        for sender in senders {
            if sender.try_send(Message::Close(None)).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    /// Verified identity of a connection, when it authenticated.
    pub async fn identity_of(&self, id: ConnectionId) -> Option<Claims> {
        let inner = self.inner.read().await;
        inner.connections.get(&id).and_then(|e| e.identity.clone())
    }

    /// Rooms a connection has joined, sorted for stable output.
    pub async fn rooms_of(&self, id: ConnectionId) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut rooms: Vec<String> = inner
            .connections
            .get(&id)
            .map(|entry| entry.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Members of a room; empty for unknown rooms.
    pub async fn members_of(&self, room: &str) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }
}

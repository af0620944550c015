//! Handler seams: application logic plugs in here.
//!
//! The server core drives a [`SessionHandler`]; the client dispatches
//! incoming events through an [`EventHandlerRegistry`]. Registration is
//! explicit and returns a [`HandlerRegistration`] handle for later
//! deregistration; there is no global or decorator-style registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::auth::Claims;
use crate::protocol::Envelope;
use crate::server::registry::{ConnectionId, ConnectionRegistry};

/// Server-side application callback, one shared instance across all
/// sessions.
///
/// `on_connect`/`on_disconnect` fire in pairs, only for sessions that
/// passed authentication and entered the active loop. `on_message`
/// receives every envelope the core does not consume itself (room
/// subscriptions, pings, and protocol errors are handled before the
/// handler sees anything); returning `Some` sends the reply to the
/// originating connection with the request's correlation id filled in.
#[async_trait]
pub trait SessionHandler: Send + Sync + fmt::Debug {
    /// A session entered the active loop.
    async fn on_connect(&self, ctx: &SessionContext) {
        let _ = ctx;
    }

    /// An application envelope arrived.
    async fn on_message(&self, ctx: &SessionContext, envelope: Envelope) -> Option<Envelope>;

    /// A session left the active loop.
    async fn on_disconnect(&self, ctx: &SessionContext) {
        let _ = ctx;
    }
}

/// Per-session view handed to [`SessionHandler`] callbacks.
#[derive(Debug, Clone)]
pub struct SessionContext {
    connection_id: ConnectionId,
    identity: Option<Claims>,
    registry: Arc<ConnectionRegistry>,
}

impl SessionContext {
    pub(crate) fn new(
        connection_id: ConnectionId,
        identity: Option<Claims>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            connection_id,
            identity,
            registry,
        }
    }

    /// Id of the connection this session serves.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Verified claims of the connection, when it authenticated.
    #[must_use]
    pub const fn identity(&self) -> Option<&Claims> {
        self.identity.as_ref()
    }

    /// Shared registry, for operations beyond the conveniences below.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Queues an envelope to this connection, out of band of any reply.
    pub async fn send(&self, envelope: Envelope) {
        self.registry
            .send_to_connection(self.connection_id, envelope)
            .await;
    }

    /// Broadcasts to a room. Returns the number of deliveries queued.
    pub async fn broadcast(&self, room: &str, envelope: Envelope) -> usize {
        self.registry.broadcast(room, envelope).await
    }

    /// Joins this connection to a room.
    pub async fn join_room(&self, room: &str) {
        self.registry.join(self.connection_id, room).await;
    }

    /// Removes this connection from a room.
    pub async fn leave_room(&self, room: &str) {
        self.registry.leave(self.connection_id, room).await;
    }
}

/// Client-side callback for one named event.
#[async_trait]
pub trait EventHandler: Send + Sync + fmt::Debug {
    /// Called with the payload of each matching Event envelope.
    async fn handle(&self, data: &Map<String, Value>);
}

/// Handle returned by [`EventHandlerRegistry::register`]; pass it back to
/// [`EventHandlerRegistry::deregister`] to remove exactly that handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRegistration {
    event: String,
    id: u64,
}

impl HandlerRegistration {
    /// Event name the registration is bound to.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }
}

#[derive(Debug)]
struct RegisteredHandler {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

/// Ordered, deregisterable mapping of event names to handlers.
#[derive(Debug, Default)]
pub struct EventHandlerRegistry {
    inner: RwLock<HashMap<String, Vec<RegisteredHandler>>>,
    next_id: AtomicU64,
}

impl EventHandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event`. Handlers for the same event run
    /// in registration order.
    pub async fn register(
        &self,
        event: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> HandlerRegistration {
        let event = event.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().await;
        inner
            .entry(event.clone())
            .or_default()
            .push(RegisteredHandler { id, handler });
        HandlerRegistration { event, id }
    }

    /// Removes the handler behind `registration`. Returns false when it
    /// was already gone.
    pub async fn deregister(&self, registration: &HandlerRegistration) -> bool {
        let mut inner = self.inner.write().await;
        let Some(handlers) = inner.get_mut(&registration.event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|entry| entry.id != registration.id);
        let removed = handlers.len() < before;
        if handlers.is_empty() {
            inner.remove(&registration.event);
        }
        removed
    }

    /// Invokes every handler registered for `event`, in order. Returns
    /// how many ran.
    pub async fn dispatch(&self, event: &str, data: &Map<String, Value>) -> usize {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let inner = self.inner.read().await;
            inner
                .get(event)
                .map(|entries| entries.iter().map(|e| Arc::clone(&e.handler)).collect())
                .unwrap_or_default()
        };
        for handler in &handlers {
            handler.handle(data).await;
        }
        handlers.len()
    }

    /// Number of handlers currently registered for `event`.
    pub async fn handler_count(&self, event: &str) -> usize {
        let inner = self.inner.read().await;
        inner.get(event).map_or(0, Vec::len)
    }
}

//! # roomcast
//!
//! Room-addressable real-time messaging core: a WebSocket server that
//! fans events out to named rooms, and a reconnecting client that
//! correlates requests with replies over one long-lived connection.
//!
//! Application semantics stay outside: the server drives a
//! [`SessionHandler`] you inject, the client dispatches events through an
//! explicit handler registry, and payloads are opaque JSON objects.
//!
//! ## Architecture
//!
//! ```text
//! RoomcastClient                         RoomcastServer
//!     │  send / send_request                  │ accept loop (TCP → TLS? → WS)
//!     │  subscribe / on(event)                │
//!     ├── io task ── Envelope wire ────────── ├── session loop (per connection)
//!     │     │                                 │     │
//!     │  PendingRequests (correlation)        │  auth handshake (TokenAuthenticator)
//!     │  reconnect supervisor (backoff,       │  ConnectionRegistry (rooms,
//!     │    re-auth, re-subscribe)             │    broadcast fan-out)
//!     │                                       │  SessionHandler (application)
//!     └── ClientConfig                        └── ServerConfig, MetricsSink
//! ```
//!
//! ## Quick start
//!
//! Server:
//!
//! ```no_run
//! use std::sync::Arc;
//! use roomcast::{Envelope, RoomcastServer, ServerConfig, SessionContext, SessionHandler};
//!
//! #[derive(Debug)]
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl SessionHandler for Echo {
//!     async fn on_message(&self, _ctx: &SessionContext, env: Envelope) -> Option<Envelope> {
//!         Some(Envelope::response_to(&env, env.data.clone()))
//!     }
//! }
//!
//! # async fn run() -> Result<(), roomcast::RoomcastError> {
//! let server = RoomcastServer::new(ServerConfig::default(), Arc::new(Echo));
//! server.run().await
//! # }
//! ```
//!
//! Client:
//!
//! ```no_run
//! use roomcast::{ClientConfig, RoomcastClient};
//!
//! # async fn run() -> Result<(), roomcast::RoomcastError> {
//! let client = RoomcastClient::new(ClientConfig::default())?;
//! client.connect().await?;
//! client.subscribe("pool:btc-usd").await?;
//! let reply = client
//!     .send_request("status.get", serde_json::Map::new(), None)
//!     .await?;
//! println!("{:?}", reply.data);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod tls;

pub use auth::{Claims, TokenAuthenticator};
pub use client::{BackoffPolicy, ConnectionState, RoomcastClient};
pub use config::{ClientConfig, ServerConfig};
pub use error::RoomcastError;
pub use handler::{
    EventHandler, EventHandlerRegistry, HandlerRegistration, SessionContext, SessionHandler,
};
pub use metrics::{MetricsSink, NoopMetrics, RecorderMetrics};
pub use protocol::{Envelope, EnvelopeKind, payload};
pub use server::{ConnectionId, ConnectionRegistry, RoomcastServer};

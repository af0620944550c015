//! Server core: listener, accept loop, and lifecycle.
//!
//! [`RoomcastServer`] binds the configured address, optionally wraps each
//! accepted socket in TLS, performs the WebSocket handshake, and hands the
//! stream to [`session::run_session`]. Plain-TCP and TLS sessions share
//! the same session driver, which is generic over the stream type.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::auth::TokenAuthenticator;
use crate::config::ServerConfig;
use crate::error::RoomcastError;
use crate::handler::SessionHandler;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::protocol::Envelope;
use crate::server::registry::{ConnectionId, ConnectionRegistry};
use crate::server::session::{self, SessionDeps};
use crate::tls;

/// Room-addressable WebSocket server.
///
/// Construct with [`RoomcastServer::new`], optionally attach a
/// [`TokenAuthenticator`] and a [`MetricsSink`], then [`start`] or [`run`]
/// it. All broadcast and directed-send operations are available both here
/// and on the shared [`ConnectionRegistry`].
///
/// [`start`]: RoomcastServer::start
/// [`run`]: RoomcastServer::run
#[derive(Debug)]
pub struct RoomcastServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn SessionHandler>,
    authenticator: Option<Arc<TokenAuthenticator>>,
    metrics: Arc<dyn MetricsSink>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RoomcastServer {
    /// Creates a server from `config` with `handler` as the application
    /// callback. No socket is opened until [`RoomcastServer::start`].
    #[must_use]
    pub fn new(config: ServerConfig, handler: Arc<dyn SessionHandler>) -> Self {
        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            Arc::clone(&metrics),
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry,
            handler,
            authenticator: None,
            metrics,
            shutdown_tx,
            local_addr: std::sync::Mutex::new(None),
            accept_task: std::sync::Mutex::new(None),
        }
    }

    /// Attaches the authenticator used by the `require_auth` handshake.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<TokenAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Replaces the default no-op metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.registry = Arc::new(ConnectionRegistry::new(
            self.config.max_connections,
            Arc::clone(&metrics),
        ));
        self.metrics = metrics;
        self
    }

    /// Shared registry, for broadcast and membership queries.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Address the listener actually bound, once started. Useful with
    /// `port = 0`.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Binds the listener and spawns the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`RoomcastError::Transport`] when the bind fails,
    /// [`RoomcastError::Certificate`] when TLS is enabled but its material
    /// cannot be loaded or generated, and [`RoomcastError::Auth`] when
    /// `require_auth` is set without an authenticator.
    pub async fn start(&self) -> Result<(), RoomcastError> {
        if self.config.require_auth && self.authenticator.is_none() {
            return Err(RoomcastError::Auth(
                "require_auth is set but no authenticator is configured".into(),
            ));
        }

        let acceptor = self.build_tls_acceptor()?;
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let local = listener.local_addr()?;
        if let Ok(mut slot) = self.local_addr.lock() {
            *slot = Some(local);
        }
        info!(
            addr = %local,
            tls = self.config.tls_enabled,
            require_auth = self.config.require_auth,
            max_connections = self.config.max_connections,
            "roomcast server listening"
        );

        let deps = Arc::new(SessionDeps {
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.handler),
            authenticator: self.authenticator.clone(),
            metrics: Arc::clone(&self.metrics),
            require_auth: self.config.require_auth,
            message_rate_limit: self.config.message_rate_limit,
            outbound_buffer: self.config.outbound_buffer,
        });
        let shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(accept_loop(listener, acceptor, deps, shutdown_rx));
        if let Ok(mut slot) = self.accept_task.lock() {
            *slot = Some(task);
        }
        Ok(())
    }

    /// Starts the server and blocks until ctrl-c or [`RoomcastServer::stop`].
    ///
    /// # Errors
    ///
    /// Same failure modes as [`RoomcastServer::start`].
    pub async fn run(&self) -> Result<(), RoomcastError> {
        self.start().await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                self.stop().await;
            }
            changed = shutdown_rx.changed() => {
                let _ = changed;
            }
        }
        Ok(())
    }

    /// Graceful shutdown: stops accepting, then closes every connection.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.accept_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        let closed = self.registry.close_all().await;
        info!(closed, "server stopped");
    }

    /// Broadcasts an envelope to every member of `room`. Passthrough to
    /// the registry; returns deliveries queued.
    pub async fn broadcast(&self, room: &str, envelope: Envelope) -> usize {
        self.registry.broadcast(room, envelope).await
    }

    /// Queues an envelope to one connection. Passthrough to the registry.
    pub async fn send_to_connection(&self, id: ConnectionId, envelope: Envelope) -> bool {
        self.registry.send_to_connection(id, envelope).await
    }

    /// Builds and broadcasts an Event envelope to `room` in one call.
    pub async fn emit_event(
        &self,
        event_name: &str,
        data: serde_json::Map<String, serde_json::Value>,
        room: &str,
    ) -> usize {
        self.broadcast(room, Envelope::event(event_name, data)).await
    }

    fn build_tls_acceptor(&self) -> Result<Option<TlsAcceptor>, RoomcastError> {
        if !self.config.tls_enabled {
            return Ok(None);
        }
        let config = if self.config.auto_cert {
            warn!("auto_cert: serving a self-signed certificate, development only");
            tls::dev_server_config(&self.config.host, &[self.config.host.clone()])?
        } else {
            let (Some(cert), Some(key)) = (&self.config.cert_file, &self.config.key_file) else {
                return Err(RoomcastError::Certificate(
                    "tls_enabled requires cert_file and key_file (or auto_cert)".into(),
                ));
            };
            tls::server_tls_config(
                cert,
                key,
                self.config.ca_file.as_deref(),
                self.config.verify_client,
            )?
        };
        Ok(Some(TlsAcceptor::from(config)))
    }
}

/// Accepts sockets until shutdown, spawning one session task per
/// connection. Accept errors are logged and the loop continues; only
/// shutdown ends it.
async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    deps: Arc<SessionDeps>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let deps = Arc::clone(&deps);
                        let acceptor = acceptor.clone();
                        let session_shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            accept_connection(socket, peer, acceptor, deps, session_shutdown).await;
                        });
                    }
                    Err(err) => {
                        error!(error = %err, "accept failed");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("accept loop stopping");
                    return;
                }
            }
        }
    }
}

/// Upgrades one accepted socket (optionally through TLS) to a WebSocket
/// and runs its session.
async fn accept_connection(
    socket: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    deps: Arc<SessionDeps>,
    shutdown_rx: watch::Receiver<bool>,
) {
    match acceptor {
        Some(acceptor) => {
            let tls_stream = match acceptor.accept(socket).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%peer, error = %err, "TLS accept failed");
                    deps.metrics.on_connection_error("tls_accept");
                    return;
                }
            };
            match tokio_tungstenite::accept_async(tls_stream).await {
                Ok(ws) => session::run_session(deps, ws, peer, shutdown_rx).await,
                Err(err) => {
                    debug!(%peer, error = %err, "WebSocket handshake failed");
                    deps.metrics.on_connection_error("ws_handshake");
                }
            }
        }
        None => match tokio_tungstenite::accept_async(socket).await {
            Ok(ws) => session::run_session(deps, ws, peer, shutdown_rx).await,
            Err(err) => {
                debug!(%peer, error = %err, "WebSocket handshake failed");
                deps.metrics.on_connection_error("ws_handshake");
            }
        },
    }
}

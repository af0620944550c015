//! Reconnecting WebSocket client.
//!
//! [`RoomcastClient`] owns one connection at a time: a background io task
//! selects over the outbound queue and inbound frames, replies resolve
//! pending requests by correlation id, and Event envelopes dispatch
//! through the client's handler registry. When the transport drops
//! unexpectedly the same task runs the reconnect supervisor: backoff,
//! re-dial, re-auth, re-subscribe every recorded room, resume. An explicit
//! [`disconnect`] suppresses the supervisor.
//!
//! [`disconnect`]: RoomcastClient::disconnect

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::client::pending::PendingRequests;
use crate::client::reconnect::BackoffPolicy;
use crate::config::ClientConfig;
use crate::error::RoomcastError;
use crate::handler::{EventHandler, EventHandlerRegistry, HandlerRegistration};
use crate::protocol::{Envelope, EnvelopeKind, codec, payload};
use crate::tls;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Observable client lifecycle, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no supervisor running.
    Disconnected,
    /// A dial (initial or reconnect) is in flight.
    Connecting,
    /// Connected; the io task is live.
    Connected,
    /// Waiting out the backoff delay before retry number `attempt`.
    Backoff(u32),
    /// The supervisor gave up after `max_retries` failures. Only an
    /// explicit `connect()` resumes.
    Failed,
}

#[derive(Debug)]
struct ClientInner {
    config: ClientConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
    pending: PendingRequests,
    rooms: Mutex<BTreeSet<String>>,
    handlers: EventHandlerRegistry,
    state_tx: watch::Sender<ConnectionState>,
    out: Mutex<Option<mpsc::Sender<Message>>>,
    explicit_close: AtomicBool,
    authenticated: AtomicBool,
    // Bumped by connect() and disconnect(); tasks carrying a stale value
    // stand down instead of fighting the new connection.
    generation: AtomicU64,
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn is_superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
            || self.explicit_close.load(Ordering::SeqCst)
    }

    async fn install_out(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(256);
        *self.out.lock().await = Some(tx);
        rx
    }

    async fn take_out(&self) -> Option<mpsc::Sender<Message>> {
        self.out.lock().await.take()
    }

    async fn out_sender(&self) -> Option<mpsc::Sender<Message>> {
        self.out.lock().await.clone()
    }
}

/// Room-subscribing, request-correlating WebSocket client.
///
/// Cheap to clone; all clones share one connection.
#[derive(Debug, Clone)]
pub struct RoomcastClient {
    inner: Arc<ClientInner>,
}

impl RoomcastClient {
    /// Builds a client from `config`. The TLS configuration for `wss://`
    /// URIs is assembled here, so certificate problems surface before any
    /// dial.
    ///
    /// # Errors
    ///
    /// Returns [`RoomcastError::Certificate`] when the URI is `wss://` and
    /// the CA bundle cannot be loaded.
    pub fn new(config: ClientConfig) -> Result<Self, RoomcastError> {
        let tls = if config.is_secure() {
            Some(tls::client_tls_config(
                config.verify_ssl,
                config.ca_file.as_deref(),
            )?)
        } else {
            None
        };
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                tls,
                pending: PendingRequests::new(),
                rooms: Mutex::new(BTreeSet::new()),
                handlers: EventHandlerRegistry::new(),
                state_tx,
                out: Mutex::new(None),
                explicit_close: AtomicBool::new(false),
                authenticated: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        })
    }

    /// Dials the server, runs the auth handshake when a token is
    /// configured, and spawns the io task.
    ///
    /// With `reconnect` enabled a dial failure engages the supervisor
    /// *and* returns the error, so callers see the failure while the
    /// client keeps healing itself in the background. Calling `connect()`
    /// while connected is a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RoomcastError::Transport`] for dial failures and
    /// [`RoomcastError::Auth`] for a rejected handshake.
    pub async fn connect(&self) -> Result<(), RoomcastError> {
        if self.is_connected() {
            warn!("connect() called on an already-connected client");
            return Ok(());
        }
        self.inner.explicit_close.store(false, Ordering::SeqCst);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_state(ConnectionState::Connecting);

        match establish(&self.inner).await {
            Ok(stream) => {
                let out_rx = self.inner.install_out().await;
                self.inner.set_state(ConnectionState::Connected);
                info!(uri = %self.inner.config.uri, "connected");
                tokio::spawn(session_task(
                    Arc::clone(&self.inner),
                    stream,
                    out_rx,
                    generation,
                ));
                Ok(())
            }
            Err(err) => {
                if self.inner.config.reconnect {
                    warn!(error = %err, "initial connection failed, supervisor engaged");
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        if let Some((stream, out_rx)) = reconnect_loop(&inner, generation).await {
                            session_task(inner, stream, out_rx, generation).await;
                        }
                    });
                } else {
                    self.inner.set_state(ConnectionState::Disconnected);
                }
                Err(err)
            }
        }
    }

    /// Closes the connection intentionally: the supervisor is suppressed,
    /// pending requests fail immediately, and the state settles at
    /// `Disconnected`.
    pub async fn disconnect(&self) {
        self.inner.explicit_close.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(sender) = self.inner.take_out().await {
            let _ = sender.send(Message::Close(None)).await;
        }
        let failed = self.inner.pending.fail_all().await;
        if failed > 0 {
            debug!(failed, "failed pending requests on disconnect");
        }
        self.inner.authenticated.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Disconnected);
        info!("disconnected");
    }

    /// Sends a fire-and-forget Event envelope.
    ///
    /// # Errors
    ///
    /// Returns [`RoomcastError::Transport`] when not connected.
    pub async fn send(&self, event_name: &str, data: Map<String, Value>) -> Result<(), RoomcastError> {
        self.send_envelope(Envelope::event(event_name, data)).await
    }

    /// Sends a Request envelope and awaits its correlated reply.
    ///
    /// `timeout` overrides the configured `request_timeout`. On timeout
    /// the pending entry is removed, so a late reply is dropped rather
    /// than resolving a request nobody is waiting on. A disconnect while
    /// waiting fails the call immediately.
    ///
    /// # Errors
    ///
    /// Returns [`RoomcastError::Timeout`] when no reply arrives in time
    /// and [`RoomcastError::Transport`] when not connected or the
    /// connection closes mid-wait.
    pub async fn send_request(
        &self,
        event_name: &str,
        data: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RoomcastError> {
        let envelope = Envelope::request(event_name, data);
        let correlation_id = envelope.correlation_id.clone().ok_or_else(|| {
            RoomcastError::Internal("request envelope without correlation id".into())
        })?;
        let reply_rx = self.inner.pending.insert(correlation_id.clone()).await;

        if let Err(err) = self.send_envelope(envelope).await {
            self.inner.pending.remove(&correlation_id).await;
            return Err(err);
        }

        let deadline = timeout.unwrap_or(self.inner.config.request_timeout);
        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RoomcastError::Transport(
                "connection closed while awaiting a reply".into(),
            )),
            Err(_) => {
                self.inner.pending.remove(&correlation_id).await;
                Err(RoomcastError::Timeout(
                    u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    /// Joins `room`, recording it for automatic re-subscription after a
    /// reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`RoomcastError::Transport`] when not connected; the room
    /// is not recorded in that case.
    pub async fn subscribe(&self, room: &str) -> Result<(), RoomcastError> {
        self.inner.rooms.lock().await.insert(room.to_owned());
        if let Err(err) = self.send_envelope(Envelope::subscribe(room)).await {
            self.inner.rooms.lock().await.remove(room);
            return Err(err);
        }
        debug!(room, "subscribed");
        Ok(())
    }

    /// Leaves `room` and forgets it for re-subscription purposes.
    ///
    /// # Errors
    ///
    /// Returns [`RoomcastError::Transport`] when not connected. The local
    /// record is removed regardless, so a later reconnect will not rejoin.
    pub async fn unsubscribe(&self, room: &str) -> Result<(), RoomcastError> {
        self.inner.rooms.lock().await.remove(room);
        self.send_envelope(Envelope::unsubscribe(room)).await?;
        debug!(room, "unsubscribed");
        Ok(())
    }

    /// Registers `handler` for incoming Event envelopes named `event`.
    /// Returns the handle [`RoomcastClient::off`] takes to remove it.
    pub async fn on(
        &self,
        event: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> HandlerRegistration {
        self.inner.handlers.register(event, handler).await
    }

    /// Removes a handler registered with [`RoomcastClient::on`]. Returns
    /// false when it was already gone.
    pub async fn off(&self, registration: &HandlerRegistration) -> bool {
        self.inner.handlers.deregister(registration).await
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch receiver observing every state transition.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// True while the io task is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected)
    }

    /// True after a successful auth handshake on the current connection.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    /// Rooms currently recorded for re-subscription, sorted.
    pub async fn rooms(&self) -> Vec<String> {
        self.inner.rooms.lock().await.iter().cloned().collect()
    }

    async fn send_envelope(&self, envelope: Envelope) -> Result<(), RoomcastError> {
        let text = codec::encode(&envelope)?;
        let sender = self
            .inner
            .out_sender()
            .await
            .ok_or_else(|| RoomcastError::Transport("not connected".into()))?;
        sender
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| RoomcastError::Transport("connection closed".into()))
    }
}

/// Dials the configured URI and, when a token is configured, runs the
/// auth handshake before anything else touches the stream.
async fn establish(inner: &ClientInner) -> Result<WsStream, RoomcastError> {
    debug!(uri = %inner.config.uri, "dialing");
    let mut stream = if let Some(tls_config) = &inner.tls {
        let connector = Connector::Rustls(Arc::clone(tls_config));
        let (stream, _) = tokio_tungstenite::connect_async_tls_with_config(
            inner.config.uri.as_str(),
            None,
            false,
            Some(connector),
        )
        .await?;
        stream
    } else {
        let (stream, _) = tokio_tungstenite::connect_async(inner.config.uri.as_str()).await?;
        stream
    };

    if let Some(token) = &inner.config.token {
        authenticate(inner, &mut stream, token).await?;
        inner.authenticated.store(true, Ordering::SeqCst);
        debug!("auth handshake accepted");
    }
    Ok(stream)
}

async fn authenticate(
    inner: &ClientInner,
    stream: &mut WsStream,
    token: &str,
) -> Result<(), RoomcastError> {
    let request = Envelope::request("auth", payload(serde_json::json!({ "token": token })));
    let correlation_id = request.correlation_id.clone();
    let text = codec::encode(&request)?;
    stream.send(Message::Text(text.into())).await?;

    let reply = tokio::time::timeout(
        inner.config.request_timeout,
        auth_reply(stream, correlation_id.as_deref()),
    )
    .await
    .map_err(|_| RoomcastError::Auth("no reply to the auth handshake".into()))??;

    match reply.kind {
        EnvelopeKind::Response => Ok(()),
        EnvelopeKind::Error => Err(RoomcastError::Auth(
            reply
                .error_message
                .unwrap_or_else(|| "authentication rejected".into()),
        )),
        _ => Err(RoomcastError::Auth(
            "unexpected reply to the auth handshake".into(),
        )),
    }
}

/// Reads frames until the handshake reply: a Response carrying our
/// correlation id, or any Error envelope.
async fn auth_reply(
    stream: &mut WsStream,
    correlation_id: Option<&str>,
) -> Result<Envelope, RoomcastError> {
    loop {
        let decoded = match stream.next().await {
            Some(Ok(Message::Text(text))) => codec::decode(text.as_str()),
            Some(Ok(Message::Binary(bytes))) => codec::decode_slice(&bytes),
            Some(Ok(Message::Close(_))) | None => {
                return Err(RoomcastError::Auth(
                    "connection closed during the auth handshake".into(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
        };
        let Ok(envelope) = decoded else { continue };
        let matches_request = envelope.correlation_id.as_deref() == correlation_id;
        if (envelope.kind == EnvelopeKind::Response && matches_request)
            || envelope.kind == EnvelopeKind::Error
        {
            return Ok(envelope);
        }
        debug!(kind = envelope.kind.as_str(), "frame before auth reply, skipping");
    }
}

/// Drives one connection until it drops, then hands over to the reconnect
/// supervisor (unless closed intentionally or reconnect is disabled).
async fn session_task(
    inner: Arc<ClientInner>,
    mut stream: WsStream,
    mut out_rx: mpsc::Receiver<Message>,
    generation: u64,
) {
    loop {
        drive(&inner, stream, &mut out_rx).await;

        let failed = inner.pending.fail_all().await;
        if failed > 0 {
            debug!(failed, "failed pending requests on connection loss");
        }
        if inner.is_superseded(generation) {
            return;
        }
        inner.take_out().await;
        inner.authenticated.store(false, Ordering::SeqCst);
        if !inner.config.reconnect {
            inner.set_state(ConnectionState::Disconnected);
            return;
        }

        warn!("connection lost, attempting to reconnect");
        match reconnect_loop(&inner, generation).await {
            Some((next_stream, next_out_rx)) => {
                stream = next_stream;
                out_rx = next_out_rx;
            }
            None => return,
        }
    }
}

/// io loop: outbound queue to the sink, inbound frames to routing.
async fn drive(inner: &Arc<ClientInner>, stream: WsStream, out_rx: &mut mpsc::Receiver<Message>) {
    let (mut sink, mut read) = stream.split();
    loop {
        tokio::select! {
            queued = out_rx.recv() => {
                let Some(message) = queued else { break };
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        route(inner, codec::decode(text.as_str())).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        route(inner, codec::decode_slice(&bytes)).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "read failed");
                        break;
                    }
                }
            }
        }
    }
}

/// Routes one decoded inbound envelope: replies resolve pending requests
/// by correlation id, Events dispatch through the handler registry, and
/// envelope-level Pings are answered in place.
async fn route(inner: &Arc<ClientInner>, decoded: Result<Envelope, RoomcastError>) {
    let envelope = match decoded {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(error = %err, "undecodable frame from server, ignoring");
            return;
        }
    };
    match envelope.kind {
        EnvelopeKind::Response | EnvelopeKind::Error | EnvelopeKind::Pong | EnvelopeKind::Ack => {
            match envelope.correlation_id.clone() {
                Some(correlation_id) => {
                    inner.pending.complete(&correlation_id, envelope).await;
                }
                None => {
                    debug!(
                        kind = envelope.kind.as_str(),
                        "reply without correlation id, dropping"
                    );
                }
            }
        }
        EnvelopeKind::Event => {
            if let Some(name) = &envelope.event_name {
                let ran = inner.handlers.dispatch(name, &envelope.data).await;
                debug!(event = %name, handlers = ran, room = envelope.room.as_deref().unwrap_or("-"), "event dispatched");
            } else {
                debug!("event envelope without an event name, dropping");
            }
        }
        EnvelopeKind::Ping => {
            if let Some(sender) = inner.out_sender().await {
                let pong = Envelope::pong_for(&envelope);
                if let Ok(text) = codec::encode(&pong) {
                    let _ = sender.try_send(Message::Text(text.into()));
                }
            }
        }
        EnvelopeKind::Request | EnvelopeKind::Subscribe | EnvelopeKind::Unsubscribe => {
            debug!(kind = envelope.kind.as_str(), "unexpected kind from server, dropping");
        }
    }
}

/// Backoff-dial-resubscribe loop. Returns the fresh stream and outbound
/// receiver on success, `None` once exhausted or superseded.
async fn reconnect_loop(
    inner: &Arc<ClientInner>,
    generation: u64,
) -> Option<(WsStream, mpsc::Receiver<Message>)> {
    let policy = BackoffPolicy::from_config(&inner.config);
    let mut attempt = 0u32;
    loop {
        if policy.is_exhausted(attempt) {
            warn!(retries = attempt, "reconnect attempts exhausted, giving up");
            inner.set_state(ConnectionState::Failed);
            return None;
        }
        inner.set_state(ConnectionState::Backoff(attempt));
        let delay = policy.delay_for(attempt);
        debug!(attempt, ?delay, "waiting before reconnect attempt");
        tokio::time::sleep(delay).await;
        if inner.is_superseded(generation) {
            return None;
        }

        inner.set_state(ConnectionState::Connecting);
        match establish(inner).await {
            Ok(mut stream) => {
                if inner.is_superseded(generation) {
                    return None;
                }
                if let Err(err) = resubscribe(inner, &mut stream).await {
                    warn!(error = %err, "re-subscription failed, retrying");
                    attempt += 1;
                    continue;
                }
                let out_rx = inner.install_out().await;
                inner.set_state(ConnectionState::Connected);
                info!(attempt, "reconnected");
                return Some((stream, out_rx));
            }
            Err(err) => {
                warn!(attempt, error = %err, "reconnect attempt failed");
                attempt += 1;
            }
        }
    }
}

/// Replays Subscribe envelopes for every recorded room on a fresh stream,
/// before the connection is announced as Connected.
async fn resubscribe(inner: &ClientInner, stream: &mut WsStream) -> Result<(), RoomcastError> {
    let rooms: Vec<String> = inner.rooms.lock().await.iter().cloned().collect();
    for room in &rooms {
        let text = codec::encode(&Envelope::subscribe(room))?;
        stream.send(Message::Text(text.into())).await?;
    }
    if !rooms.is_empty() {
        info!(rooms = rooms.len(), "re-subscribed rooms after reconnect");
    }
    Ok(())
}

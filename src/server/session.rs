//! Per-connection session state machine.
//!
//! Drives one accepted WebSocket connection through its lifecycle:
//! capacity gate, optional auth handshake, then the active loop selecting
//! over inbound frames, the outbound queue, and server shutdown. Decode
//! failures and rate-limit hits are answered with Error envelopes and the
//! session continues; auth failures close the connection with a policy
//! code. Teardown always unregisters the connection and empties its room
//! memberships, whichever state the session died in.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::auth::TokenAuthenticator;
use crate::handler::{SessionContext, SessionHandler};
use crate::metrics::MetricsSink;
use crate::protocol::{Envelope, EnvelopeKind, codec, payload};
use crate::server::registry::{ConnectionId, ConnectionRegistry};

/// Shared pieces every session borrows from the server.
#[derive(Debug)]
pub(crate) struct SessionDeps {
    pub registry: Arc<ConnectionRegistry>,
    pub handler: Arc<dyn SessionHandler>,
    pub authenticator: Option<Arc<TokenAuthenticator>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub require_auth: bool,
    pub message_rate_limit: u32,
    pub outbound_buffer: usize,
}

/// Token bucket over inbound envelopes. Refills continuously at the
/// configured rate, holds at most one second of burst.
struct RateLimiter {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `None` when `rate` is zero: limiting disabled.
    fn new(rate: u32) -> Option<Self> {
        if rate == 0 {
            return None;
        }
        let capacity = f64::from(rate);
        Some(Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity,
            last_refill: Instant::now(),
        })
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Runs one connection to completion. Never returns an error: every
/// failure path logs, cleans up, and falls through.
pub(crate) async fn run_session<S>(
    deps: Arc<SessionDeps>,
    stream: WebSocketStream<S>,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = ConnectionId::new();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(deps.outbound_buffer);

    // Capacity gate before the session proper: the rejected peer gets an
    // Error envelope and a 1013 close, and is never registered.
    if let Err(err) = deps.registry.register(id, out_tx.clone()).await {
        warn!(connection_id = %id, %peer, error = %err, "connection rejected at capacity");
        deps.metrics.on_connection_error("capacity");
        reject(stream, &err.to_string(), "CAPACITY_EXCEEDED", CloseCode::Again).await;
        return;
    }

    let (mut sink, mut read) = stream.split();

    let identity = if deps.require_auth {
        match authenticate_first_message(&deps, id, &mut sink, &mut read).await {
            AuthOutcome::Authenticated(claims) => Some(claims),
            AuthOutcome::Rejected => {
                deps.registry.unregister(id).await;
                return;
            }
        }
    } else {
        None
    };

    deps.metrics.on_connect();
    let ctx = SessionContext::new(id, identity, Arc::clone(&deps.registry));
    deps.handler.on_connect(&ctx).await;
    info!(
        connection_id = %id,
        %peer,
        subject = ctx.identity().map_or("-", |c| c.subject.as_str()),
        "connection established"
    );

    let mut limiter = RateLimiter::new(deps.message_rate_limit);
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
                    Some(Ok(frame)) => {
                        if !handle_frame(&deps, &ctx, &mut limiter, &out_tx, frame).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(connection_id = %id, error = %err, "read failed");
                        break;
                    }
                    None => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Away,
                            reason: "server shutting down".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    }

    deps.handler.on_disconnect(&ctx).await;
    deps.metrics.on_disconnect();
    deps.registry.unregister(id).await;
    info!(connection_id = %id, %peer, "connection closed");
}

enum AuthOutcome {
    Authenticated(crate::auth::Claims),
    Rejected,
}

/// First-message auth handshake. Anything other than a valid
/// `Request{event: "auth"}` carrying a verifiable token rejects the
/// connection with a policy close.
async fn authenticate_first_message<S>(
    deps: &SessionDeps,
    id: ConnectionId,
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    read: &mut SplitStream<WebSocketStream<S>>,
) -> AuthOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let envelope = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => break codec::decode(text.as_str()),
            Some(Ok(Message::Binary(bytes))) => break codec::decode_slice(&bytes),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                debug!(connection_id = %id, "connection ended before authentication");
                return AuthOutcome::Rejected;
            }
            Some(Ok(_)) => {} // transport ping/pong, keep waiting
        }
    };

    let auth_request = match envelope {
        Ok(env)
            if env.kind == EnvelopeKind::Request && env.event_name.as_deref() == Some("auth") =>
        {
            env
        }
        other => {
            let correlation = other.ok().and_then(|env| env.correlation_id);
            warn!(connection_id = %id, "first message was not an auth request");
            deps.metrics.on_connection_error("auth_required");
            let reply = Envelope::error(
                "AUTH_REQUIRED",
                "authentication required as first message",
                correlation,
            );
            close_with_error(sink, &reply, CloseCode::Policy).await;
            return AuthOutcome::Rejected;
        }
    };

    let claims = deps.authenticator.as_ref().and_then(|authenticator| {
        auth_request
            .auth_token()
            .and_then(|token| authenticator.verify(token))
    });
    let Some(claims) = claims else {
        warn!(connection_id = %id, "authentication failed");
        deps.metrics.on_connection_error("auth_failed");
        let reply = Envelope::error(
            "AUTH_FAILED",
            "invalid or expired token",
            auth_request.correlation_id,
        );
        close_with_error(sink, &reply, CloseCode::Policy).await;
        return AuthOutcome::Rejected;
    };

    deps.registry.set_identity(id, claims.clone()).await;
    let reply = Envelope::response_to(
        &auth_request,
        payload(serde_json::json!({
            "status": "authenticated",
            "subject": claims.subject,
        })),
    );
    if let Ok(text) = codec::encode(&reply) {
        if sink.send(Message::Text(text.into())).await.is_err() {
            return AuthOutcome::Rejected;
        }
        deps.metrics.on_message_sent(reply.kind.as_str());
    }
    info!(connection_id = %id, subject = %claims.subject, "connection authenticated");
    AuthOutcome::Authenticated(claims)
}

/// Handles one inbound frame in the active state. Returns false when the
/// session should end.
async fn handle_frame(
    deps: &SessionDeps,
    ctx: &SessionContext,
    limiter: &mut Option<RateLimiter>,
    out_tx: &mpsc::Sender<Message>,
    frame: Message,
) -> bool {
    match frame {
        Message::Text(text) => {
            handle_envelope(deps, ctx, limiter, out_tx, codec::decode(text.as_str())).await;
            true
        }
        Message::Binary(bytes) => {
            handle_envelope(deps, ctx, limiter, out_tx, codec::decode_slice(&bytes)).await;
            true
        }
        Message::Ping(data) => {
            // Answer explicitly: the auto-queued pong only flushes with
            // the next outbound write, which may be far away.
            let _ = out_tx.try_send(Message::Pong(data));
            true
        }
        Message::Pong(_) | Message::Frame(_) => true,
        Message::Close(_) => false,
    }
}

async fn handle_envelope(
    deps: &SessionDeps,
    ctx: &SessionContext,
    limiter: &mut Option<RateLimiter>,
    out_tx: &mpsc::Sender<Message>,
    decoded: Result<Envelope, crate::error::RoomcastError>,
) {
    let id = ctx.connection_id();
    let envelope = match decoded {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(connection_id = %id, error = %err, "undecodable message");
            deps.metrics.on_message_error("decode");
            let reply = Envelope::error(err.error_code(), err.to_string(), None);
            queue_reply(deps, out_tx, &reply);
            return;
        }
    };
    deps.metrics.on_message_received(envelope.kind.as_str());

    if let Some(limiter) = limiter
        && !limiter.allow()
    {
        debug!(connection_id = %id, "message rate limit exceeded");
        deps.metrics.on_message_error("rate_limited");
        let reply = Envelope::error(
            "RATE_LIMITED",
            "message rate limit exceeded",
            envelope.correlation_id,
        );
        queue_reply(deps, out_tx, &reply);
        return;
    }

    match envelope.kind {
        EnvelopeKind::Subscribe => {
            if let Some(room) = envelope.data_room() {
                deps.registry.join(id, room).await;
                info!(connection_id = %id, room, "joined room");
            } else {
                let reply = Envelope::error(
                    "INVALID_REQUEST",
                    "subscribe requires data.room",
                    envelope.correlation_id,
                );
                queue_reply(deps, out_tx, &reply);
            }
        }
        EnvelopeKind::Unsubscribe => {
            if let Some(room) = envelope.data_room() {
                deps.registry.leave(id, room).await;
                info!(connection_id = %id, room, "left room");
            } else {
                let reply = Envelope::error(
                    "INVALID_REQUEST",
                    "unsubscribe requires data.room",
                    envelope.correlation_id,
                );
                queue_reply(deps, out_tx, &reply);
            }
        }
        EnvelopeKind::Ping => {
            queue_reply(deps, out_tx, &Envelope::pong_for(&envelope));
        }
        EnvelopeKind::Response | EnvelopeKind::Error => {
            // The server never issues correlated requests, so a reply
            // from a client answers nothing.
            warn!(
                connection_id = %id,
                correlation_id = envelope.correlation_id.as_deref().unwrap_or("-"),
                "reply from client matches no pending request"
            );
            deps.metrics.on_message_error("unmatched_reply");
        }
        EnvelopeKind::Request | EnvelopeKind::Event | EnvelopeKind::Ack | EnvelopeKind::Pong => {
            let correlation = envelope.correlation_id.clone();
            let started = Instant::now();
            let reply = deps.handler.on_message(ctx, envelope).await;
            deps.metrics.observe_latency("dispatch", started.elapsed());
            if let Some(mut reply) = reply {
                if reply.correlation_id.is_none() {
                    reply.correlation_id = correlation;
                }
                queue_reply(deps, out_tx, &reply);
            }
        }
    }
}

/// Queues an envelope onto this session's own outbound buffer. Uses
/// `try_send` like every delivery path: a full buffer drops the reply
/// rather than wedging the loop that is responsible for draining it.
fn queue_reply(deps: &SessionDeps, out_tx: &mpsc::Sender<Message>, envelope: &Envelope) {
    match codec::encode(envelope) {
        Ok(text) => match out_tx.try_send(Message::Text(text.into())) {
            Ok(()) => deps.metrics.on_message_sent(envelope.kind.as_str()),
            Err(err) => {
                warn!(error = %err, "dropping reply, outbound buffer full");
                deps.metrics.on_message_error("delivery_dropped");
            }
        },
        Err(err) => warn!(error = %err, "reply failed to encode"),
    }
}

/// Sends an Error envelope then a close frame on a not-yet-split stream.
async fn reject<S>(mut stream: WebSocketStream<S>, message: &str, code: &str, close: CloseCode)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = Envelope::error(code, message, None);
    if let Ok(text) = codec::encode(&reply) {
        let _ = stream.send(Message::Text(text.into())).await;
    }
    let _ = stream
        .send(Message::Close(Some(CloseFrame {
            code: close,
            reason: message.to_owned().into(),
        })))
        .await;
}

/// Sends an Error envelope then a close frame on the write half.
async fn close_with_error<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    envelope: &Envelope,
    close: CloseCode,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Ok(text) = codec::encode(envelope) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
    let reason = envelope.error_message.clone().unwrap_or_default();
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[test]
    fn limiter_disabled_at_rate_zero() {
        assert!(RateLimiter::new(0).is_none());
    }

    #[test]
    fn limiter_allows_a_burst_then_denies() {
        let Some(mut limiter) = RateLimiter::new(5) else {
            panic!("limiter should be enabled");
        };
        for _ in 0..5 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());
    }

    #[test]
    fn limiter_refills_over_time() {
        let Some(mut limiter) = RateLimiter::new(100) else {
            panic!("limiter should be enabled");
        };
        while limiter.allow() {}
        std::thread::sleep(Duration::from_millis(25));
        assert!(limiter.allow(), "tokens should refill with elapsed time");
    }

    #[derive(Debug)]
    struct EchoHandler;

    #[async_trait]
    impl SessionHandler for EchoHandler {
        async fn on_message(&self, _ctx: &SessionContext, envelope: Envelope) -> Option<Envelope> {
            (envelope.kind == EnvelopeKind::Request)
                .then(|| Envelope::response_to(&envelope, envelope.data.clone()))
        }
    }

    fn deps(registry: Arc<ConnectionRegistry>) -> Arc<SessionDeps> {
        deps_with_limit(registry, 0)
    }

    fn deps_with_limit(registry: Arc<ConnectionRegistry>, rate: u32) -> Arc<SessionDeps> {
        Arc::new(SessionDeps {
            registry,
            handler: Arc::new(EchoHandler),
            authenticator: None,
            metrics: Arc::new(NoopMetrics),
            require_auth: false,
            message_rate_limit: rate,
            outbound_buffer: 16,
        })
    }

    async fn spawn_session(
        deps: Arc<SessionDeps>,
    ) -> WebSocketStream<tokio::io::DuplexStream> {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server_ws =
            WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client_ws =
            WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let Ok(peer) = "127.0.0.1:0".parse() else {
            panic!("peer literal failed to parse");
        };
        tokio::spawn(async move {
            run_session(deps, server_ws, peer, shutdown_rx).await;
            drop(_shutdown_tx);
        });
        client_ws
    }

    async fn next_envelope(
        client: &mut WebSocketStream<tokio::io::DuplexStream>,
    ) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next()).await;
        let Ok(Some(Ok(Message::Text(text)))) = frame else {
            panic!("expected a text frame, got {frame:?}");
        };
        let Ok(envelope) = codec::decode(text.as_str()) else {
            panic!("reply failed to decode");
        };
        envelope
    }

    async fn send_envelope(
        client: &mut WebSocketStream<tokio::io::DuplexStream>,
        envelope: &Envelope,
    ) {
        let Ok(text) = codec::encode(envelope) else {
            panic!("encode failed");
        };
        if client.send(Message::Text(text.into())).await.is_err() {
            panic!("send failed");
        }
    }

    #[tokio::test]
    async fn request_is_echoed_with_correlation() {
        let registry = Arc::new(ConnectionRegistry::new(4, Arc::new(NoopMetrics)));
        let mut client = spawn_session(deps(Arc::clone(&registry))).await;

        let request = Envelope::request("echo", crate::protocol::payload(json!({"n": 1})));
        send_envelope(&mut client, &request).await;
        let reply = next_envelope(&mut client).await;
        assert_eq!(reply.kind, EnvelopeKind::Response);
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.data.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn decode_error_is_recoverable() {
        let registry = Arc::new(ConnectionRegistry::new(4, Arc::new(NoopMetrics)));
        let mut client = spawn_session(deps(Arc::clone(&registry))).await;

        if client.send(Message::Text("{not json".into())).await.is_err() {
            panic!("send failed");
        }
        let reply = next_envelope(&mut client).await;
        assert_eq!(reply.kind, EnvelopeKind::Error);
        assert_eq!(reply.error_code.as_deref(), Some("DECODE_ERROR"));

        // The session survived: a protocol ping still gets its pong.
        send_envelope(&mut client, &Envelope::ping()).await;
        let pong = next_envelope(&mut client).await;
        assert_eq!(pong.kind, EnvelopeKind::Pong);
    }

    #[tokio::test]
    async fn over_limit_message_is_refused_and_the_session_survives() {
        let registry = Arc::new(ConnectionRegistry::new(4, Arc::new(NoopMetrics)));
        let mut client = spawn_session(deps_with_limit(Arc::clone(&registry), 1)).await;

        // The first envelope takes the bucket's only token.
        send_envelope(&mut client, &Envelope::ping()).await;
        let pong = next_envelope(&mut client).await;
        assert_eq!(pong.kind, EnvelopeKind::Pong);

        // The immediate follow-up is refused with its correlation id, not
        // dropped silently.
        let request = Envelope::request("echo", crate::protocol::payload(json!({"n": 2})));
        send_envelope(&mut client, &request).await;
        let reply = next_envelope(&mut client).await;
        assert_eq!(reply.kind, EnvelopeKind::Error);
        assert_eq!(reply.error_code.as_deref(), Some("RATE_LIMITED"));
        assert_eq!(reply.correlation_id, request.correlation_id);

        // After the bucket refills the same session keeps serving.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        send_envelope(&mut client, &Envelope::ping()).await;
        let pong = next_envelope(&mut client).await;
        assert_eq!(pong.kind, EnvelopeKind::Pong);
    }

    #[tokio::test]
    async fn subscribe_updates_the_registry() {
        let registry = Arc::new(ConnectionRegistry::new(4, Arc::new(NoopMetrics)));
        let mut client = spawn_session(deps(Arc::clone(&registry))).await;

        send_envelope(&mut client, &Envelope::subscribe("pool:btc")).await;
        // Round-trip a ping so the subscribe is definitely processed.
        send_envelope(&mut client, &Envelope::ping()).await;
        let _ = next_envelope(&mut client).await;
        assert_eq!(registry.members_of("pool:btc").await.len(), 1);

        send_envelope(&mut client, &Envelope::unsubscribe("pool:btc")).await;
        send_envelope(&mut client, &Envelope::ping()).await;
        let _ = next_envelope(&mut client).await;
        assert!(registry.members_of("pool:btc").await.is_empty());
    }

    #[tokio::test]
    async fn subscribe_without_room_is_an_invalid_request() {
        let registry = Arc::new(ConnectionRegistry::new(4, Arc::new(NoopMetrics)));
        let mut client = spawn_session(deps(registry)).await;

        let mut bare = Envelope::subscribe("x");
        bare.data.clear();
        send_envelope(&mut client, &bare).await;
        let reply = next_envelope(&mut client).await;
        assert_eq!(reply.error_code.as_deref(), Some("INVALID_REQUEST"));
    }

    #[tokio::test]
    async fn close_frame_unregisters_the_connection() {
        let registry = Arc::new(ConnectionRegistry::new(4, Arc::new(NoopMetrics)));
        let mut client = spawn_session(deps(Arc::clone(&registry))).await;

        send_envelope(&mut client, &Envelope::ping()).await;
        let _ = next_envelope(&mut client).await;
        assert_eq!(registry.connection_count().await, 1);

        let _ = client.close(None).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.connection_count().await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_or_else(|_| panic!("connection was not unregistered"), |()| ());
    }
}

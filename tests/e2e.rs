//! End-to-end scenarios driving a real server and client over localhost.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use roomcast::{
    ClientConfig, ConnectionState, Envelope, EnvelopeKind, EventHandler, RoomcastClient,
    RoomcastError, RoomcastServer, ServerConfig, SessionContext, SessionHandler,
    TokenAuthenticator, payload,
};

/// Echoes requests back; ignores everything else.
#[derive(Debug)]
struct EchoHandler;

#[async_trait]
impl SessionHandler for EchoHandler {
    async fn on_message(&self, _ctx: &SessionContext, envelope: Envelope) -> Option<Envelope> {
        (envelope.kind == EnvelopeKind::Request)
            .then(|| Envelope::response_to(&envelope, envelope.data.clone()))
    }
}

/// Swallows every message without replying.
#[derive(Debug)]
struct SilentHandler;

#[async_trait]
impl SessionHandler for SilentHandler {
    async fn on_message(&self, _ctx: &SessionContext, _envelope: Envelope) -> Option<Envelope> {
        None
    }
}

/// Forwards received event payloads into a channel for assertions.
#[derive(Debug)]
struct ChannelHandler {
    tx: mpsc::UnboundedSender<Map<String, Value>>,
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, data: &Map<String, Value>) {
        let _ = self.tx.send(data.clone());
    }
}

fn loopback_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        ..ServerConfig::default()
    }
}

async fn start_server(config: ServerConfig, handler: Arc<dyn SessionHandler>) -> RoomcastServer {
    let server = RoomcastServer::new(config, handler);
    server.start().await.expect("server start");
    server
}

fn client_config(server: &RoomcastServer) -> ClientConfig {
    let addr = server.local_addr().expect("server address");
    ClientConfig {
        uri: format!("ws://{addr}"),
        reconnect: false,
        ..ClientConfig::default()
    }
}

/// Polls `check` until it passes or two seconds elapse.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn request_reply_round_trip() {
    let server = start_server(loopback_config(), Arc::new(EchoHandler)).await;
    let client = RoomcastClient::new(client_config(&server)).expect("client");
    client.connect().await.expect("connect");

    let reply = client
        .send_request("echo", payload(json!({"n": 7})), None)
        .await
        .expect("reply");
    assert_eq!(reply.kind, EnvelopeKind::Response);
    assert_eq!(reply.data.get("n"), Some(&json!(7)));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn room_broadcast_reaches_subscribed_client_once() {
    let server = start_server(loopback_config(), Arc::new(SilentHandler)).await;
    let client = RoomcastClient::new(client_config(&server)).expect("client");
    client.connect().await.expect("connect");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("pool.status_changed", Arc::new(ChannelHandler { tx })).await;
    client.subscribe("pool:1").await.expect("subscribe");

    let registry = server.registry();
    eventually(|| {
        let registry = Arc::clone(&registry);
        async move { !registry.members_of("pool:1").await.is_empty() }
    })
    .await;

    let delivered = server
        .emit_event(
            "pool.status_changed",
            payload(json!({"status": "draining"})),
            "pool:1",
        )
        .await;
    assert_eq!(delivered, 1);

    let data = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("event payload");
    assert_eq!(data.get("status"), Some(&json!("draining")));

    // Exactly once: no second delivery shows up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn auth_handshake_succeeds_with_a_valid_token() {
    let authenticator = Arc::new(TokenAuthenticator::new("e2e-secret"));
    let token = authenticator
        .issue("user-7", vec!["read".into()], Duration::from_secs(60))
        .expect("token");

    let config = ServerConfig {
        require_auth: true,
        ..loopback_config()
    };
    let server = RoomcastServer::new(config, Arc::new(EchoHandler))
        .with_authenticator(Arc::clone(&authenticator));
    server.start().await.expect("server start");

    let client = RoomcastClient::new(ClientConfig {
        token: Some(token),
        ..client_config(&server)
    })
    .expect("client");
    client.connect().await.expect("connect");
    assert!(client.is_authenticated());

    let reply = client
        .send_request("whoami", Map::new(), None)
        .await
        .expect("reply");
    assert_eq!(reply.kind, EnvelopeKind::Response);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn invalid_token_is_rejected_with_auth_failed() {
    let config = ServerConfig {
        require_auth: true,
        ..loopback_config()
    };
    let server = RoomcastServer::new(config, Arc::new(EchoHandler))
        .with_authenticator(Arc::new(TokenAuthenticator::new("server-secret")));
    server.start().await.expect("server start");

    let bogus = TokenAuthenticator::new("other-secret")
        .issue("intruder", vec![], Duration::from_secs(60))
        .expect("token");
    let client = RoomcastClient::new(ClientConfig {
        token: Some(bogus),
        ..client_config(&server)
    })
    .expect("client");

    let result = client.connect().await;
    assert!(matches!(result, Err(RoomcastError::Auth(_))));
    assert!(!client.is_connected());

    server.stop().await;
}

#[tokio::test]
async fn non_auth_first_message_gets_auth_required_and_a_close() {
    let config = ServerConfig {
        require_auth: true,
        ..loopback_config()
    };
    let server = RoomcastServer::new(config, Arc::new(EchoHandler))
        .with_authenticator(Arc::new(TokenAuthenticator::new("server-secret")));
    server.start().await.expect("server start");
    let addr = server.local_addr().expect("server address");

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("dial");
    let ping = serde_json::to_string(&Envelope::ping()).expect("encode");
    ws.send(Message::Text(ping.into())).await.expect("send");

    let mut saw_error = false;
    let mut saw_close = false;
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_secs(2), ws.next()).await
    {
        match frame {
            Ok(Message::Text(text)) => {
                let envelope: Envelope = serde_json::from_str(text.as_str()).expect("decode");
                assert_eq!(envelope.kind, EnvelopeKind::Error);
                assert_eq!(envelope.error_code.as_deref(), Some("AUTH_REQUIRED"));
                saw_error = true;
            }
            Ok(Message::Close(_)) | Err(_) => {
                saw_close = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_error, "no AUTH_REQUIRED error envelope");
    assert!(saw_close, "connection was not closed");

    server.stop().await;
}

#[tokio::test]
async fn second_connection_over_capacity_is_rejected() {
    let config = ServerConfig {
        max_connections: 1,
        ..loopback_config()
    };
    let server = start_server(config, Arc::new(EchoHandler)).await;
    let addr = server.local_addr().expect("server address");

    let first = RoomcastClient::new(client_config(&server)).expect("client");
    first.connect().await.expect("connect");

    let registry = server.registry();
    eventually(|| {
        let registry = Arc::clone(&registry);
        async move { registry.connection_count().await == 1 }
    })
    .await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("dial");
    let mut saw_capacity_error = false;
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_secs(2), ws.next()).await
    {
        match frame {
            Ok(Message::Text(text)) => {
                let envelope: Envelope = serde_json::from_str(text.as_str()).expect("decode");
                assert_eq!(envelope.error_code.as_deref(), Some("CAPACITY_EXCEEDED"));
                saw_capacity_error = true;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    assert!(saw_capacity_error, "no CAPACITY_EXCEEDED error envelope");

    // The first connection still works.
    let reply = first
        .send_request("still.alive", Map::new(), None)
        .await
        .expect("reply");
    assert_eq!(reply.kind, EnvelopeKind::Response);

    first.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let server = start_server(loopback_config(), Arc::new(SilentHandler)).await;
    let client = RoomcastClient::new(client_config(&server)).expect("client");
    client.connect().await.expect("connect");

    let result = client
        .send_request("void", Map::new(), Some(Duration::from_millis(200)))
        .await;
    assert!(matches!(result, Err(RoomcastError::Timeout(200))));

    // The connection itself is untouched by the timeout.
    assert!(client.is_connected());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn reconnect_restores_room_subscriptions() {
    let server = start_server(loopback_config(), Arc::new(SilentHandler)).await;
    let addr = server.local_addr().expect("server address");

    let client = RoomcastClient::new(ClientConfig {
        reconnect: true,
        max_retries: 10,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        ..client_config(&server)
    })
    .expect("client");
    client.connect().await.expect("connect");
    client.subscribe("a").await.expect("subscribe a");
    client.subscribe("b").await.expect("subscribe b");

    // Drop the server out from under the client.
    server.stop().await;
    let mut states = client.state_changes();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            states.changed().await.expect("state channel");
            if matches!(*states.borrow(), ConnectionState::Backoff(_)) {
                break;
            }
        }
    })
    .await
    .expect("client never noticed the disconnect");

    // Bring a fresh server up on the same address.
    let replacement = start_server(
        ServerConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..ServerConfig::default()
        },
        Arc::new(SilentHandler),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if client.is_connected() {
                break;
            }
            states.changed().await.expect("state channel");
        }
    })
    .await
    .expect("client never reconnected");

    // Both rooms were re-established without caller intervention.
    let registry = replacement.registry();
    eventually(|| {
        let registry = Arc::clone(&registry);
        async move {
            !registry.members_of("a").await.is_empty()
                && !registry.members_of("b").await.is_empty()
        }
    })
    .await;
    assert_eq!(client.rooms().await, vec!["a", "b"]);

    client.disconnect().await;
    replacement.stop().await;
}

#[tokio::test]
async fn exhausted_retries_settle_at_failed_until_reconnected() {
    let server = start_server(loopback_config(), Arc::new(SilentHandler)).await;
    let addr = server.local_addr().expect("server address");

    let client = RoomcastClient::new(ClientConfig {
        reconnect: true,
        max_retries: 2,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(50),
        ..client_config(&server)
    })
    .expect("client");
    client.connect().await.expect("connect");

    // Stop the server and leave nothing listening, so every retry fails.
    server.stop().await;
    let mut states = client.state_changes();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *states.borrow_and_update() != ConnectionState::Failed {
            states.changed().await.expect("state channel");
        }
    })
    .await
    .expect("supervisor never gave up");
    assert_eq!(client.state(), ConnectionState::Failed);
    assert!(!client.is_connected());

    // Failed is sticky until an explicit connect().
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), ConnectionState::Failed);

    let replacement = start_server(
        ServerConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..ServerConfig::default()
        },
        Arc::new(SilentHandler),
    )
    .await;
    client.connect().await.expect("connect after failure");
    assert!(client.is_connected());

    client.disconnect().await;
    replacement.stop().await;
}

#[tokio::test]
async fn explicit_disconnect_suppresses_the_supervisor() {
    let server = start_server(loopback_config(), Arc::new(SilentHandler)).await;
    let client = RoomcastClient::new(ClientConfig {
        reconnect: true,
        initial_delay: Duration::from_millis(50),
        ..client_config(&server)
    })
    .expect("client");
    client.connect().await.expect("connect");

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // No reconnect attempt follows an intentional close.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(server.registry().connection_count().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn tls_with_auto_cert_serves_a_secure_round_trip() {
    let config = ServerConfig {
        tls_enabled: true,
        auto_cert: true,
        ..loopback_config()
    };
    let server = start_server(config, Arc::new(EchoHandler)).await;
    let addr = server.local_addr().expect("server address");

    let client = RoomcastClient::new(ClientConfig {
        uri: format!("wss://{addr}"),
        reconnect: false,
        // self-signed development certificate
        verify_ssl: false,
        ..ClientConfig::default()
    })
    .expect("client");
    client.connect().await.expect("connect over TLS");

    let reply = client
        .send_request("secure.echo", payload(json!({"ok": true})), None)
        .await
        .expect("reply");
    assert_eq!(reply.data.get("ok"), Some(&json!(true)));

    client.disconnect().await;
    server.stop().await;
}

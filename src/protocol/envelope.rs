//! Envelope type: the single message shape shared by server and client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Discriminator for envelope kinds.
///
/// Client → server: `request`, `subscribe`, `unsubscribe`, `ping`.
/// Server → client: `response`, `event`, `error`, `pong`.
/// Either direction: `ack`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Correlated client request expecting a reply.
    Request,
    /// Join a room.
    Subscribe,
    /// Leave a room.
    Unsubscribe,
    /// Liveness probe.
    Ping,
    /// Successful reply to a request.
    Response,
    /// Broadcast or directed application event.
    Event,
    /// Failure reply or protocol error notification.
    Error,
    /// Reply to a ping.
    Pong,
    /// Bare acknowledgement.
    Ack,
}

impl EnvelopeKind {
    /// Wire string for this kind. Used as a metrics label and log field.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Ping => "ping",
            Self::Response => "response",
            Self::Event => "event",
            Self::Error => "error",
            Self::Pong => "pong",
            Self::Ack => "ack",
        }
    }
}

/// Uniform message envelope.
///
/// `id` and `kind` are mandatory on the wire; everything else is optional
/// or defaulted. The `data` payload is opaque to the core: it is carried
/// byte-for-byte (modulo JSON re-serialization) and never validated beyond
/// the auth handshake and room operations, so applications may put any
/// fields they like inside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique message id, a fresh UUIDv4 per envelope.
    pub id: String,
    /// Links replies to the request that caused them. Replies copy the
    /// request's value verbatim.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Kind discriminator.
    pub kind: EnvelopeKind,
    /// Application event name; set for Request and Event envelopes.
    #[serde(default)]
    pub event_name: Option<String>,
    /// Opaque application payload.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Creation time, advisory only. Defaults to now when absent.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Target room, stamped by broadcast delivery.
    #[serde(default)]
    pub room: Option<String>,
    /// Stable error code, set on Error envelopes.
    #[serde(default)]
    pub error_code: Option<String>,
    /// Human-readable error detail, set on Error envelopes.
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Envelope {
    fn base(kind: EnvelopeKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: None,
            kind,
            event_name: None,
            data: Map::new(),
            timestamp: Utc::now(),
            room: None,
            error_code: None,
            error_message: None,
        }
    }

    /// Builds a Request with a fresh correlation id.
    #[must_use]
    pub fn request(event_name: impl Into<String>, data: Map<String, Value>) -> Self {
        let mut env = Self::base(EnvelopeKind::Request);
        env.correlation_id = Some(Uuid::new_v4().to_string());
        env.event_name = Some(event_name.into());
        env.data = data;
        env
    }

    /// Builds a Response to `request`, copying its correlation id and
    /// event name.
    #[must_use]
    pub fn response_to(request: &Self, data: Map<String, Value>) -> Self {
        let mut env = Self::base(EnvelopeKind::Response);
        env.correlation_id = request.correlation_id.clone();
        env.event_name = request.event_name.clone();
        env.data = data;
        env
    }

    /// Builds a fire-and-forget Event.
    #[must_use]
    pub fn event(event_name: impl Into<String>, data: Map<String, Value>) -> Self {
        let mut env = Self::base(EnvelopeKind::Event);
        env.event_name = Some(event_name.into());
        env.data = data;
        env
    }

    /// Builds an Error envelope. `correlation_id` links it to the request
    /// it answers, when there is one.
    #[must_use]
    pub fn error(
        code: impl Into<String>,
        message: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        let mut env = Self::base(EnvelopeKind::Error);
        env.correlation_id = correlation_id;
        env.error_code = Some(code.into());
        env.error_message = Some(message.into());
        env
    }

    /// Builds a Subscribe envelope for `room`.
    #[must_use]
    pub fn subscribe(room: &str) -> Self {
        let mut env = Self::base(EnvelopeKind::Subscribe);
        env.data.insert("room".into(), Value::String(room.into()));
        env
    }

    /// Builds an Unsubscribe envelope for `room`.
    #[must_use]
    pub fn unsubscribe(room: &str) -> Self {
        let mut env = Self::base(EnvelopeKind::Unsubscribe);
        env.data.insert("room".into(), Value::String(room.into()));
        env
    }

    /// Builds a Ping with a fresh correlation id so the pong can be
    /// matched to it.
    #[must_use]
    pub fn ping() -> Self {
        let mut env = Self::base(EnvelopeKind::Ping);
        env.correlation_id = Some(Uuid::new_v4().to_string());
        env
    }

    /// Builds the Pong answering `ping`, echoing its correlation id and
    /// payload.
    #[must_use]
    pub fn pong_for(ping: &Self) -> Self {
        let mut env = Self::base(EnvelopeKind::Pong);
        env.correlation_id = ping.correlation_id.clone();
        env.data = ping.data.clone();
        env
    }

    /// Sets the room tag. Used by broadcast and by event producers.
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Room name carried in the payload of Subscribe/Unsubscribe
    /// envelopes.
    #[must_use]
    pub fn data_room(&self) -> Option<&str> {
        self.data.get("room").and_then(Value::as_str)
    }

    /// Token carried in the payload of the auth handshake request.
    #[must_use]
    pub fn auth_token(&self) -> Option<&str> {
        self.data.get("token").and_then(Value::as_str)
    }
}

/// Builds a payload map from a `serde_json::json!` object literal.
///
/// Non-object values yield an empty payload; payloads are JSON objects by
/// contract.
#[must_use]
pub fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

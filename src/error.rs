//! Error types with wire error-code and close-code mapping.
//!
//! [`RoomcastError`] is the central error type for the crate. Each variant
//! maps to a stable string error code (carried in Error envelopes) and,
//! where the failure is fatal to a connection, a WebSocket close code.

/// Central error enum for server, client, codec, auth, and TLS paths.
///
/// # Severity
///
/// | Variant       | Scope                    | Fatal to connection |
/// |---------------|--------------------------|---------------------|
/// | `Decode`      | single message           | no                  |
/// | `Timeout`     | single request (client)  | no                  |
/// | `Auth`        | handshake                | yes (close 1008)    |
/// | `Capacity`    | accept                   | yes (close 1013)    |
/// | `Transport`   | socket I/O               | yes (close 1011)    |
/// | `Certificate` | startup configuration    | process-level       |
/// | `Internal`    | bug guard                | yes (close 1011)    |
#[derive(Debug, thiserror::Error)]
pub enum RoomcastError {
    /// Inbound bytes could not be decoded into a valid envelope.
    #[error("failed to decode envelope: {0}")]
    Decode(String),

    /// Token verification or the auth handshake failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server is at its configured connection limit.
    #[error("server at maximum capacity ({max} connections)")]
    Capacity {
        /// Configured connection limit that was hit.
        max: usize,
    },

    /// A correlated request saw no reply within its deadline.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Socket-level failure: dial, accept, read, write, or a send while
    /// not connected.
    #[error("transport error: {0}")]
    Transport(String),

    /// Certificate or TLS configuration problem at startup.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Invariant violation that should be unreachable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RoomcastError {
    /// Returns the stable string code carried in Error envelopes.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "DECODE_ERROR",
            Self::Auth(_) => "AUTH_FAILED",
            Self::Capacity { .. } => "CAPACITY_EXCEEDED",
            Self::Timeout(_) => "REQUEST_TIMEOUT",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Certificate(_) => "CERTIFICATE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the WebSocket close code for variants that end a
    /// connection, `None` for recoverable or pre-connection failures.
    #[must_use]
    pub const fn close_code(&self) -> Option<u16> {
        match self {
            Self::Decode(_) | Self::Timeout(_) | Self::Certificate(_) => None,
            Self::Auth(_) => Some(1008),
            Self::Capacity { .. } => Some(1013),
            Self::Transport(_) | Self::Internal(_) => Some(1011),
        }
    }

    /// True for failures a session survives (the message is answered with
    /// an Error envelope and the loop continues).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for RoomcastError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RoomcastError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<rustls::Error> for RoomcastError {
    fn from(err: rustls::Error) -> Self {
        Self::Certificate(err.to_string())
    }
}

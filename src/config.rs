//! Server and client configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`), prefixed `ROOMCAST_`. Missing or
//! malformed values fall back to defaults, so loading never fails.

use std::path::PathBuf;
use std::time::Duration;

/// Server-side configuration.
///
/// Loaded once at startup via [`ServerConfig::from_env`], or built in
/// code starting from [`ServerConfig::default`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind (e.g. `127.0.0.1`, `0.0.0.0`).
    pub host: String,

    /// Port to bind.
    pub port: u16,

    /// Hard cap on concurrent connections; the cap-plus-first connection
    /// is rejected at accept time.
    pub max_connections: usize,

    /// Per-connection inbound messages per second. `0` disables the
    /// limiter.
    pub message_rate_limit: u32,

    /// Require the auth handshake as the first message of every
    /// connection.
    pub require_auth: bool,

    /// Shared secret the binary wires into a `TokenAuthenticator`; the
    /// library itself takes the authenticator instance.
    pub auth_secret: Option<String>,

    /// Serve `wss://` instead of `ws://`.
    pub tls_enabled: bool,

    /// PEM certificate chain, required when TLS is enabled without
    /// `auto_cert`.
    pub cert_file: Option<PathBuf>,

    /// PEM private key matching `cert_file`.
    pub key_file: Option<PathBuf>,

    /// CA bundle for verifying client certificates.
    pub ca_file: Option<PathBuf>,

    /// Demand a verified client certificate on every TLS connection.
    pub verify_client: bool,

    /// Generate a self-signed certificate at startup instead of loading
    /// files. Development only.
    pub auto_cert: bool,

    /// Per-connection outbound queue capacity; a full queue drops
    /// deliveries rather than blocking.
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8688,
            max_connections: 1000,
            message_rate_limit: 100,
            require_auth: false,
            auth_secret: None,
            tls_enabled: false,
            cert_file: None,
            key_file: None,
            ca_file: None,
            verify_client: false,
            auto_cert: false,
            outbound_buffer: 256,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `ROOMCAST_*` environment variables,
    /// reading an optional `.env` file first. Unset or unparsable
    /// variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            host: std::env::var("ROOMCAST_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: parse_env("ROOMCAST_PORT", 8688),
            max_connections: parse_env("ROOMCAST_MAX_CONNECTIONS", 1000),
            message_rate_limit: parse_env("ROOMCAST_MESSAGE_RATE_LIMIT", 100),
            require_auth: parse_env_bool("ROOMCAST_REQUIRE_AUTH", false),
            auth_secret: std::env::var("ROOMCAST_AUTH_SECRET").ok(),
            tls_enabled: parse_env_bool("ROOMCAST_TLS_ENABLED", false),
            cert_file: parse_env_path("ROOMCAST_CERT_FILE"),
            key_file: parse_env_path("ROOMCAST_KEY_FILE"),
            ca_file: parse_env_path("ROOMCAST_CA_FILE"),
            verify_client: parse_env_bool("ROOMCAST_VERIFY_CLIENT", false),
            auto_cert: parse_env_bool("ROOMCAST_AUTO_CERT", false),
            outbound_buffer: parse_env("ROOMCAST_OUTBOUND_BUFFER", 256),
        }
    }

    /// `host:port` string for the TCP listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// WebSocket URI clients should dial to reach this server.
    #[must_use]
    pub fn uri(&self) -> String {
        let scheme = if self.tls_enabled { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URI, `ws://` or `wss://`.
    pub uri: String,

    /// Auth token presented in the handshake; `None` skips the handshake.
    pub token: Option<String>,

    /// Re-establish the connection after unexpected drops.
    pub reconnect: bool,

    /// Consecutive failed reconnect attempts before giving up.
    pub max_retries: u32,

    /// Backoff delay before the first reconnect attempt; doubles per
    /// attempt.
    pub initial_delay: Duration,

    /// Ceiling for the backoff delay.
    pub max_delay: Duration,

    /// Default deadline for correlated requests.
    pub request_timeout: Duration,

    /// Verify the server certificate chain. Disable only against
    /// development servers with self-signed certificates.
    pub verify_ssl: bool,

    /// Extra CA bundle trusted in addition to the webpki roots.
    pub ca_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            uri: "ws://127.0.0.1:8688".into(),
            token: None,
            reconnect: true,
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            verify_ssl: true,
            ca_file: None,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from `ROOMCAST_*` environment variables,
    /// reading an optional `.env` file first. Unset or unparsable
    /// variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            uri: std::env::var("ROOMCAST_URI").unwrap_or_else(|_| "ws://127.0.0.1:8688".into()),
            token: std::env::var("ROOMCAST_TOKEN").ok(),
            reconnect: parse_env_bool("ROOMCAST_RECONNECT", true),
            max_retries: parse_env("ROOMCAST_MAX_RETRIES", 5),
            initial_delay: Duration::from_millis(parse_env("ROOMCAST_INITIAL_DELAY_MS", 1000)),
            max_delay: Duration::from_millis(parse_env("ROOMCAST_MAX_DELAY_MS", 60_000)),
            request_timeout: Duration::from_secs(parse_env("ROOMCAST_REQUEST_TIMEOUT_SECS", 30)),
            verify_ssl: parse_env_bool("ROOMCAST_VERIFY_SSL", true),
            ca_file: parse_env_path("ROOMCAST_CA_FILE"),
        }
    }

    /// True when the URI dials a TLS endpoint.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.uri.starts_with("wss://")
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref() {
        Some("true") | Some("TRUE") | Some("1") => true,
        Some("false") | Some("FALSE") | Some("0") => false,
        _ => default,
    }
}

/// Reads an environment variable as a path, `None` when unset.
fn parse_env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

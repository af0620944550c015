//! roomcast server entry point.
//!
//! Runs a relay server: requests are echoed back to their sender, events
//! carrying a `room` field are broadcast to that room. Configuration comes
//! from `ROOMCAST_*` environment variables.

use std::sync::Arc;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use roomcast::{
    Envelope, EnvelopeKind, RecorderMetrics, RoomcastServer, ServerConfig, SessionContext,
    SessionHandler, TokenAuthenticator,
};

/// Echoes requests and relays room-tagged events.
#[derive(Debug)]
struct RelayHandler;

#[async_trait]
impl SessionHandler for RelayHandler {
    async fn on_message(&self, ctx: &SessionContext, envelope: Envelope) -> Option<Envelope> {
        match envelope.kind {
            EnvelopeKind::Request => Some(Envelope::response_to(&envelope, envelope.data.clone())),
            EnvelopeKind::Event => {
                if let Some(room) = envelope.room.clone() {
                    ctx.broadcast(&room, envelope).await;
                }
                None
            }
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(addr = %config.bind_addr(), "starting roomcast");

    let mut server = RoomcastServer::new(config.clone(), Arc::new(RelayHandler))
        .with_metrics(Arc::new(RecorderMetrics));
    if let Some(secret) = &config.auth_secret {
        server = server.with_authenticator(Arc::new(TokenAuthenticator::new(secret.as_bytes())));
    }

    server.run().await?;
    Ok(())
}

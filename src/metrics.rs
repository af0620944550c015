//! Metrics sink interface.
//!
//! The core reports connection, message, and broadcast activity through
//! the [`MetricsSink`] trait and never blocks on it; implementations must
//! be cheap and non-panicking. [`RecorderMetrics`] forwards to whatever
//! recorder the host process installed via the `metrics` facade; exposing
//! the numbers over HTTP (or anywhere else) is the host's business.

use std::fmt;
use std::time::Duration;

/// Hooks invoked by the server core on connection and message activity.
///
/// All methods default to no-ops so implementations override only what
/// they record.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// A connection completed its handshake and entered the session loop.
    fn on_connect(&self) {}

    /// A connection left the session loop.
    fn on_disconnect(&self) {}

    /// An envelope was queued for delivery to a connection.
    fn on_message_sent(&self, kind: &'static str) {
        let _ = kind;
    }

    /// An envelope arrived from a connection.
    fn on_message_received(&self, kind: &'static str) {
        let _ = kind;
    }

    /// A room broadcast completed its fan-out.
    fn on_broadcast(&self, room: &str, delivered: usize, elapsed: Duration) {
        let _ = (room, delivered, elapsed);
    }

    /// A connection was rejected or torn down abnormally.
    fn on_connection_error(&self, reason: &'static str) {
        let _ = reason;
    }

    /// A single message failed without ending its connection.
    fn on_message_error(&self, reason: &'static str) {
        let _ = reason;
    }

    /// Duration of one dispatch through the session handler.
    fn observe_latency(&self, operation: &'static str, elapsed: Duration) {
        let _ = (operation, elapsed);
    }
}

/// Discards everything. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Forwards every hook to the process-wide `metrics` recorder.
///
/// Series: `roomcast_connections_total`, `roomcast_connections_active`,
/// `roomcast_messages_total{kind,direction}`,
/// `roomcast_broadcast_total{room}`, `roomcast_broadcast_deliveries_total`,
/// `roomcast_broadcast_duration_seconds`,
/// `roomcast_connection_errors_total{reason}`,
/// `roomcast_message_errors_total{reason}`,
/// `roomcast_latency_seconds{operation}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl MetricsSink for RecorderMetrics {
    fn on_connect(&self) {
        metrics::counter!("roomcast_connections_total").increment(1);
        metrics::gauge!("roomcast_connections_active").increment(1.0);
    }

    fn on_disconnect(&self) {
        metrics::gauge!("roomcast_connections_active").decrement(1.0);
    }

    fn on_message_sent(&self, kind: &'static str) {
        metrics::counter!("roomcast_messages_total", "kind" => kind, "direction" => "outbound")
            .increment(1);
    }

    fn on_message_received(&self, kind: &'static str) {
        metrics::counter!("roomcast_messages_total", "kind" => kind, "direction" => "inbound")
            .increment(1);
    }

    fn on_broadcast(&self, room: &str, delivered: usize, elapsed: Duration) {
        metrics::counter!("roomcast_broadcast_total", "room" => room.to_owned()).increment(1);
        metrics::counter!("roomcast_broadcast_deliveries_total").increment(delivered as u64);
        metrics::histogram!("roomcast_broadcast_duration_seconds").record(elapsed.as_secs_f64());
    }

    fn on_connection_error(&self, reason: &'static str) {
        metrics::counter!("roomcast_connection_errors_total", "reason" => reason).increment(1);
    }

    fn on_message_error(&self, reason: &'static str) {
        metrics::counter!("roomcast_message_errors_total", "reason" => reason).increment(1);
    }

    fn observe_latency(&self, operation: &'static str, elapsed: Duration) {
        metrics::histogram!("roomcast_latency_seconds", "operation" => operation)
            .record(elapsed.as_secs_f64());
    }
}

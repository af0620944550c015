//! Correlation-keyed map of in-flight requests.
//!
//! Every `send_request` parks a oneshot sender here under its correlation
//! id. An entry leaves the map exactly once: completed by a matching
//! reply, removed on timeout, or dropped wholesale when the connection
//! dies (the receiver then observes a closed channel, not a timeout).

use std::collections::HashMap;

use tokio::sync::{Mutex, oneshot};
use tracing::debug;

use crate::protocol::Envelope;

#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a pending request and returns the receiver its reply will
    /// arrive on. A second insert under the same correlation id replaces
    /// the first, whose receiver then observes a closed channel.
    pub(crate) async fn insert(&self, correlation_id: String) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        if self.inner.lock().await.insert(correlation_id, tx).is_some() {
            debug!("replaced a pending request with a duplicate correlation id");
        }
        rx
    }

    /// Resolves the pending request matching `correlation_id` with
    /// `reply`. Returns false when no entry matches, in which case the
    /// reply is dropped (a late answer after timeout lands here).
    pub(crate) async fn complete(&self, correlation_id: &str, reply: Envelope) -> bool {
        let Some(tx) = self.inner.lock().await.remove(correlation_id) else {
            debug!(correlation_id, "reply matches no pending request, dropping");
            return false;
        };
        // A send failure means the waiter already gave up; that also
        // counts as "not delivered".
        tx.send(reply).is_ok()
    }

    /// Removes an entry without resolving it. Called on timeout.
    pub(crate) async fn remove(&self, correlation_id: &str) -> bool {
        self.inner.lock().await.remove(correlation_id).is_some()
    }

    /// Drops every pending entry; each waiter observes a closed channel
    /// immediately instead of running out its timeout. Returns how many
    /// were failed.
    pub(crate) async fn fail_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let count = inner.len();
        inner.clear();
        count
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

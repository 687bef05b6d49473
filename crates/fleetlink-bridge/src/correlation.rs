//! Call-id → one-shot callback correlation.

use dashmap::DashMap;
use fleetlink_core::RpcResponse;
use tokio::sync::oneshot;
use tracing::debug;

/// Pending one-shot entries keyed by call id.
///
/// Each entry is consumed exactly once by a matching response, or
/// abandoned (never invoked) on caller timeout. Lookup + remove is a
/// single atomic operation, so a response with id X delivered while
/// caller X is pending goes to exactly that caller.
pub struct PendingCalls {
    entries: DashMap<String, oneshot::Sender<RpcResponse>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a pending entry for `id` and return the receiving end.
    ///
    /// Must be called before the call is sent, to avoid a race against
    /// an early response. Call ids are unique among in-flight calls;
    /// re-registering an id replaces (and thereby abandons) the old
    /// entry.
    pub fn subscribe(&self, id: &str) -> oneshot::Receiver<RpcResponse> {
        let (tx, rx) = oneshot::channel();
        let _ = self.entries.insert(id.to_owned(), tx);
        rx
    }

    /// Deliver a response to its pending caller, if any.
    ///
    /// Atomic load-and-remove: only the first response for a given id is
    /// delivered. Returns `false` when the response was dropped because
    /// no entry matched (duplicate, unknown, or already abandoned).
    pub fn fulfill(&self, response: RpcResponse) -> bool {
        match self.entries.remove(&response.id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => {
                debug!(id = %response.id, "unmatched response dropped");
                false
            }
        }
    }

    /// Abandon the entry for `id` without invoking it.
    pub fn discard(&self, id: &str) {
        let _ = self.entries.remove(id);
    }

    /// Drop every pending entry.
    ///
    /// Waiting receivers resolve with a recv error, which callers
    /// surface as "not connected". Used by the disconnect handler.
    pub fn fail_all(&self) {
        self.entries.clear();
    }

    /// Number of in-flight entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

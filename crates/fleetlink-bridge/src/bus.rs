//! Pub/sub request/reply seam for cross-instance call bridging.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fleetlink_core::BusError;
use futures::future::BoxFuture;
use tracing::debug;

/// Topic handler: request payload in, reply payload out.
///
/// An empty reply is a NAK: "the subscribed instance accepted the
/// request but cannot serve it right now, retry".
pub type BusHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Vec<u8>> + Send + Sync>;

/// Request/reply pub/sub transport between backend instances.
///
/// The bridge assumes a private network; securing the transport is the
/// deployment's concern, not this trait's.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a request on `topic` and wait up to `timeout` for a reply.
    async fn request(
        &self,
        topic: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError>;

    /// Subscribe `handler` to `topic`. The subscription ends when the
    /// returned guard is dropped.
    fn subscribe(&self, topic: &str, handler: BusHandler) -> Subscription;
}

/// Guard for one topic subscription; unsubscribes on drop.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap an unsubscribe action.
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// In-process [`MessageBus`] backed by a shared topic table.
///
/// Instances sharing one `InProcessBus` (directly or via `clone`) see
/// each other's subscriptions. Faithful to broker semantics the router
/// depends on: per-request timeout, no-responder error, empty-reply NAK.
#[derive(Clone, Default)]
pub struct InProcessBus {
    topics: Arc<DashMap<String, BusHandler>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.topics.len()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn request(
        &self,
        topic: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let Some(handler) = self.topics.get(topic).map(|entry| Arc::clone(entry.value()))
        else {
            return Err(BusError::NoResponders(topic.to_owned()));
        };
        tokio::time::timeout(timeout, handler(payload))
            .await
            .map_err(|_| BusError::Timeout)
    }

    fn subscribe(&self, topic: &str, handler: BusHandler) -> Subscription {
        debug!(topic, "bus subscription created");
        let _ = self.topics.insert(topic.to_owned(), Arc::clone(&handler));
        let topics = Arc::clone(&self.topics);
        let topic = topic.to_owned();
        // Identity-aware removal: a stale guard must not tear down a
        // replacement subscription on the same topic.
        Subscription::new(move || {
            let _ = topics.remove_if(&topic, |_, current| Arc::ptr_eq(current, &handler));
        })
    }
}

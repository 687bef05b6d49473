//! Graceful shutdown coordination via `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use fleetlink_bridge::{drain_all, DeviceRegistry};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Coordinates graceful shutdown: drain device connections first, then
/// stop the HTTP listener.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token the HTTP server's graceful-shutdown future watches.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drain every local device connection, then release the listener.
    ///
    /// 1. Each connection is asked to close; waits run concurrently,
    ///    each bounded by `drain_timeout`.
    /// 2. The shutdown token is cancelled, ending `axum::serve`'s
    ///    graceful-shutdown wait.
    pub async fn drain_and_stop(&self, registry: &Arc<DeviceRegistry>, drain_timeout: Duration) {
        info!("shutdown initiated");
        drain_all(registry, drain_timeout).await;
        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

//! Bounded-wait drain of every local connection on shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::registry::DeviceRegistry;

/// Ask every locally connected device to close and wait, bounded, for
/// the closes to complete.
///
/// All connections are drained concurrently: total wall time is bounded
/// by the slowest single wait, not the sum. A connection that does not
/// acknowledge within `timeout` is abandoned with a warning; its entry
/// is torn down by the disconnect path whenever the read loop exits.
pub async fn drain_all(registry: &Arc<DeviceRegistry>, timeout: Duration) {
    let handles = registry.handles();
    if handles.is_empty() {
        return;
    }
    info!(connections = handles.len(), "draining device connections");

    let waits = handles.into_iter().map(|handle| async move {
        handle.request_close();
        if tokio::time::timeout(timeout, handle.wait_closed())
            .await
            .is_err()
        {
            warn!(device_id = %handle.device_id(), "connection did not close within drain timeout");
        }
    });
    let _ = join_all(waits).await;
    info!("drain complete");
}

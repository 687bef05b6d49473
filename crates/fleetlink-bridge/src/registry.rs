//! Per-instance registry of live device connections.

use std::sync::Arc;

use dashmap::DashMap;
use fleetlink_core::DeviceId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::Subscription;
use crate::channel::DuplexChannel;
use crate::correlation::PendingCalls;

/// One live device connection as the bridge sees it.
///
/// Owns the channel send side, the connection's pending-call map, and
/// (when bridging is enabled) the device's bus subscription. Owned
/// exclusively by its registry entry; destroyed on disconnect or forced
/// drain-close.
pub struct DeviceHandle {
    device_id: DeviceId,
    /// Duplex call channel toward/from the transport tasks.
    pub channel: DuplexChannel,
    /// In-flight correlation entries for this device.
    pub pending: PendingCalls,
    bus_sub: parking_lot::Mutex<Option<Subscription>>,
    close_requested: CancellationToken,
    closed: CancellationToken,
}

impl DeviceHandle {
    pub fn new(device_id: DeviceId, channel: DuplexChannel) -> Self {
        Self {
            device_id,
            channel,
            pending: PendingCalls::new(),
            bus_sub: parking_lot::Mutex::new(None),
            close_requested: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Attach the device's bus subscription; it lives exactly as long as
    /// this handle stays registered.
    pub fn attach_subscription(&self, sub: Subscription) {
        *self.bus_sub.lock() = Some(sub);
    }

    /// Ask the transport to send a close frame and wind the connection
    /// down. Idempotent.
    pub fn request_close(&self) {
        self.close_requested.cancel();
    }

    /// Token the transport write loop watches for close requests.
    pub fn close_requested(&self) -> CancellationToken {
        self.close_requested.clone()
    }

    /// Resolves once the connection has been fully torn down
    /// (close acknowledged or read loop exited).
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Tear the handle down: flag the channel closed, fail every pending
    /// call with "not connected", drop the bus subscription, and fire
    /// the close acknowledgement. Idempotent; every step tolerates the
    /// replace-and-close race.
    fn finalize(&self) {
        let _ = self.channel.close();
        self.pending.fail_all();
        *self.bus_sub.lock() = None;
        self.closed.cancel();
    }
}

/// Concurrent map of device identity → active connection handle.
///
/// Authoritative answer to "is this device connected to ME". No global
/// lock: entries are inserted and removed under DashMap's per-shard
/// locking only.
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Arc<DeviceHandle>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
        }
    }

    /// Register a freshly connected device.
    ///
    /// Duplicate-connect policy: replace-and-close-old. A reconnecting
    /// (roaming) device must win; the displaced handle is closed and its
    /// pending calls fail with "not connected". Returns the displaced
    /// handle, if any.
    pub fn register(&self, handle: Arc<DeviceHandle>) -> Option<Arc<DeviceHandle>> {
        let old = self
            .devices
            .insert(handle.device_id().clone(), Arc::clone(&handle));
        if let Some(old) = &old {
            info!(device_id = %old.device_id(), "duplicate connect, replacing old connection");
            old.request_close();
            old.finalize();
        }
        debug!(device_id = %handle.device_id(), "device registered");
        old
    }

    /// Non-blocking lookup.
    pub fn lookup(&self, device_id: &DeviceId) -> Option<Arc<DeviceHandle>> {
        self.devices.get(device_id).map(|entry| Arc::clone(&entry))
    }

    /// Remove and tear down a connection. Called exactly once per
    /// handle, from the disconnect path.
    ///
    /// Identity-aware: when the handle was already displaced by a
    /// replacement connection, the replacement's entry is left alone.
    pub fn unregister(&self, handle: &Arc<DeviceHandle>) {
        let _ = self
            .devices
            .remove_if(handle.device_id(), |_, current| Arc::ptr_eq(current, handle));
        handle.finalize();
        debug!(device_id = %handle.device_id(), "device unregistered");
    }

    /// Number of locally connected devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Snapshot of every live handle (used by the drainer).
    pub fn handles(&self) -> Vec<Arc<DeviceHandle>> {
        self.devices
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

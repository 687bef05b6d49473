//! Distributed call router: local-first delivery with pub/sub fallback.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fleetlink_core::{BridgeError, BusError, DeviceId, RpcCall, RpcResponse};
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::{BusHandler, MessageBus};
use crate::metrics::{record_call, record_error, BRIDGE_NAK_RETRIES_TOTAL};
use crate::registry::{DeviceHandle, DeviceRegistry};

/// Router timeouts and retry bounds.
///
/// Which methods get extended bus timeouts is configuration data, not
/// control flow: `long_method_timeouts` maps method name → per-call bus
/// timeout.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Deadline for a locally connected device to answer (default 120 s).
    pub local_call_timeout: Duration,
    /// Deadline the *receiving* instance gives its local device when
    /// serving a bridged call (default 30 s).
    pub remote_call_timeout: Duration,
    /// Per-attempt bus request timeout (default 5 s).
    pub bus_timeout: Duration,
    /// Per-method overrides of `bus_timeout` for long-running calls.
    pub long_method_timeouts: HashMap<String, Duration>,
    /// Attempts allowed on bus-level timeout (default 3).
    pub max_retries: u32,
    /// Pause between NAK retries; NAKs never consume the retry budget.
    pub nak_backoff: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut long_method_timeouts = HashMap::new();
        let _ = long_method_timeouts.insert("takeSnapshot".to_owned(), Duration::from_secs(30));
        Self {
            local_call_timeout: Duration::from_secs(120),
            remote_call_timeout: Duration::from_secs(30),
            bus_timeout: Duration::from_secs(5),
            long_method_timeouts,
            max_retries: 3,
            nak_backoff: Duration::from_millis(100),
        }
    }
}

impl RouterConfig {
    /// The bus timeout to use for one call.
    fn bus_timeout_for(&self, method: &str) -> Duration {
        self.long_method_timeouts
            .get(method)
            .copied()
            .unwrap_or(self.bus_timeout)
    }
}

/// Public entry point for issuing calls to devices, from any instance,
/// regardless of where the device's connection lives.
pub struct CallRouter {
    registry: Arc<DeviceRegistry>,
    bus: Option<Arc<dyn MessageBus>>,
    config: RouterConfig,
}

impl CallRouter {
    /// Create a router. `bus: None` disables cross-instance bridging:
    /// calls to devices that are not local fail immediately.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        bus: Option<Arc<dyn MessageBus>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn bridging_enabled(&self) -> bool {
        self.bus.is_some()
    }

    /// Issue `call` to `device_id` and wait for its response.
    ///
    /// Tries local delivery first, then the bus bridge when enabled.
    pub async fn call(
        &self,
        device_id: &DeviceId,
        call: RpcCall,
    ) -> Result<RpcResponse, BridgeError> {
        if let Some(handle) = self.registry.lookup(device_id) {
            record_call("local");
            return Self::call_local(&handle, call, self.config.local_call_timeout).await;
        }
        match &self.bus {
            Some(bus) => {
                record_call("bus");
                self.call_bridged(bus.as_ref(), device_id, &call).await
            }
            None => Err(BridgeError::NotConnected),
        }
    }

    /// Deliver a call over the device's local duplex channel and wait.
    async fn call_local(
        handle: &Arc<DeviceHandle>,
        call: RpcCall,
        deadline: Duration,
    ) -> Result<RpcResponse, BridgeError> {
        let id = call.id.clone();
        // Subscribe before the call is enqueued, so an early response
        // cannot race past the correlation entry.
        let rx = handle.pending.subscribe(&id);
        if let Err(err) = handle.channel.send_call(call) {
            handle.pending.discard(&id);
            if matches!(err, BridgeError::QueueFull) {
                // The connection is stalled; close it rather than let
                // producers back up behind it.
                record_error(handle.device_id(), "overflow");
                warn!(device_id = %handle.device_id(), "inbound queue overflow, closing connection");
                handle.request_close();
            }
            return Err(BridgeError::NotConnected);
        }
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the device disconnected mid-flight.
            Ok(Err(_)) => Err(BridgeError::NotConnected),
            Err(_) => {
                // Abandon the entry; a late response is silently dropped.
                handle.pending.discard(&id);
                record_error(handle.device_id(), "timeout");
                Err(BridgeError::Timeout)
            }
        }
    }

    /// Route a call to whichever instance holds the device, over the bus.
    async fn call_bridged(
        &self,
        bus: &dyn MessageBus,
        device_id: &DeviceId,
        call: &RpcCall,
    ) -> Result<RpcResponse, BridgeError> {
        let payload = serde_json::to_vec(call)?;
        let topic = device_id.call_topic();
        let per_attempt = self.config.bus_timeout_for(&call.method);
        let overall_deadline = Instant::now() + self.config.local_call_timeout;

        let mut attempts: u32 = 0;
        let mut last_err = BridgeError::Timeout;
        while attempts < self.config.max_retries {
            if Instant::now() >= overall_deadline {
                record_error(device_id, "timeout");
                return Err(BridgeError::Timeout);
            }
            match bus.request(&topic, payload.clone(), per_attempt).await {
                Ok(reply) if reply.is_empty() => {
                    // Soft NAK: the holding instance accepted but the
                    // device is mid-reconnect. Retry without consuming
                    // the budget, bounded by the overall deadline.
                    debug!(device_id = %device_id, method = %call.method, "bus NAK, retrying");
                    counter!(BRIDGE_NAK_RETRIES_TOTAL).increment(1);
                    record_error(device_id, "nak");
                    tokio::time::sleep(self.config.nak_backoff).await;
                }
                Ok(reply) => return Ok(serde_json::from_slice(&reply)?),
                // Nothing subscribed to the topic: the device is not
                // connected anywhere. No point retrying.
                Err(BusError::NoResponders(_)) => return Err(BridgeError::NotConnected),
                Err(err) => {
                    attempts += 1;
                    warn!(
                        device_id = %device_id,
                        method = %call.method,
                        attempts,
                        error = %err,
                        "bus request failed"
                    );
                    last_err = match err {
                        BusError::Timeout => {
                            record_error(device_id, "timeout");
                            BridgeError::Timeout
                        }
                        other => BridgeError::Bus(other),
                    };
                }
            }
        }
        Err(last_err)
    }

    /// Subscribe the device's private call topic, wiring bridged calls
    /// into its local duplex channel. No-op when bridging is disabled.
    pub fn attach_bus_subscription(&self, handle: &Arc<DeviceHandle>) {
        let Some(bus) = &self.bus else { return };
        let weak = Arc::downgrade(handle);
        let wait = self.config.remote_call_timeout;
        let handler: BusHandler = Arc::new(move |payload| {
            let weak = Weak::clone(&weak);
            Box::pin(async move {
                match weak.upgrade() {
                    Some(handle) => serve_bus_call(&handle, &payload, wait).await,
                    // Torn down between dispatch and upgrade: NAK.
                    None => Vec::new(),
                }
            })
        });
        let sub = bus.subscribe(&handle.device_id().call_topic(), handler);
        handle.attach_subscription(sub);
    }
}

/// Serve one bridged call against a locally held device connection.
///
/// Every failure path replies with an empty payload (NAK) so the
/// issuing instance can retry; only a real device response travels back
/// serialized.
pub async fn serve_bus_call(
    handle: &Arc<DeviceHandle>,
    payload: &[u8],
    wait: Duration,
) -> Vec<u8> {
    let device_id = handle.device_id().clone();
    let call: RpcCall = match serde_json::from_slice(payload) {
        Ok(call) => call,
        Err(err) => {
            record_error(&device_id, "unmarshal");
            warn!(device_id = %device_id, error = %err, "undecodable bridged call");
            return Vec::new();
        }
    };

    let id = call.id.clone();
    let rx = handle.pending.subscribe(&id);

    if let Err(err) = handle.channel.send_call(call) {
        handle.pending.discard(&id);
        if matches!(err, BridgeError::QueueFull) {
            record_error(&device_id, "overflow");
            warn!(device_id = %device_id, "inbound queue overflow, closing connection");
            handle.request_close();
        }
        return Vec::new();
    }

    match tokio::time::timeout(wait, rx).await {
        Ok(Ok(response)) => match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(err) => {
                record_error(&device_id, "marshal");
                warn!(device_id = %device_id, error = %err, "unserializable response");
                Vec::new()
            }
        },
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            handle.pending.discard(&id);
            record_error(&device_id, "timeout");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::bus::{InProcessBus, Subscription};
    use crate::channel::{DuplexChannel, DuplexReceivers, DEFAULT_QUEUE_CAPACITY};

    fn quick_config() -> RouterConfig {
        RouterConfig {
            local_call_timeout: Duration::from_millis(500),
            remote_call_timeout: Duration::from_millis(200),
            bus_timeout: Duration::from_millis(50),
            long_method_timeouts: HashMap::new(),
            max_retries: 3,
            nak_backoff: Duration::from_millis(1),
        }
    }

    fn connect_device(registry: &Arc<DeviceRegistry>, id: &str) -> (Arc<DeviceHandle>, DuplexReceivers) {
        let (channel, rx) = DuplexChannel::new(DEFAULT_QUEUE_CAPACITY);
        let handle = Arc::new(DeviceHandle::new(DeviceId::new(id), channel));
        let _ = registry.register(Arc::clone(&handle));
        (handle, rx)
    }

    /// Echo the device side: answer every inbound call with a success.
    fn spawn_device_echo(handle: Arc<DeviceHandle>, mut rx: DuplexReceivers) {
        let _ = tokio::spawn(async move {
            while let Some(call) = rx.calls.recv().await {
                let _ = handle
                    .pending
                    .fulfill(RpcResponse::success(call.id, json!({"success": true})));
            }
        });
    }

    #[tokio::test]
    async fn local_call_round_trip() {
        let registry = Arc::new(DeviceRegistry::new());
        let (handle, rx) = connect_device(&registry, "d1");
        spawn_device_echo(Arc::clone(&handle), rx);

        let router = CallRouter::new(registry, None, quick_config());
        let resp = router
            .call(&DeviceId::new("d1"), RpcCall::new("1", "forwardLogs"))
            .await
            .unwrap();
        assert_eq!(resp.id, "1");
        assert_eq!(resp.result.unwrap()["success"], true);
    }

    #[tokio::test]
    async fn not_connected_without_bridging_fails_immediately() {
        let registry = Arc::new(DeviceRegistry::new());
        let router = CallRouter::new(registry, None, quick_config());

        let started = std::time::Instant::now();
        let err = router
            .call(&DeviceId::new("ghost"), RpcCall::new("1", "forwardLogs"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
        assert!(started.elapsed() < Duration::from_millis(50), "no timeout delay");
    }

    #[tokio::test]
    async fn local_timeout_abandons_entry() {
        let registry = Arc::new(DeviceRegistry::new());
        // Device that never answers.
        let (handle, _rx) = connect_device(&registry, "d1");

        let config = RouterConfig {
            local_call_timeout: Duration::from_millis(30),
            ..quick_config()
        };
        let router = CallRouter::new(registry, None, config);
        let err = router
            .call(&DeviceId::new("d1"), RpcCall::new("1", "forwardLogs"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout));
        // The entry was discarded; a late response is dropped silently.
        assert!(handle.pending.is_empty());
        assert!(!handle
            .pending
            .fulfill(RpcResponse::success("1", json!(null))));
    }

    #[tokio::test]
    async fn full_inbound_queue_fails_fast_and_closes_connection() {
        let registry = Arc::new(DeviceRegistry::new());
        let (channel, _rx) = DuplexChannel::new(1);
        let handle = Arc::new(DeviceHandle::new(DeviceId::new("d1"), channel));
        let _ = registry.register(Arc::clone(&handle));
        // Fill the queue; nothing drains it (stalled socket).
        handle
            .channel
            .send_call(RpcCall::new("fill", "forwardLogs"))
            .unwrap();

        let config = RouterConfig {
            local_call_timeout: Duration::from_millis(50),
            ..quick_config()
        };
        let router = CallRouter::new(Arc::clone(&registry), None, config);

        let started = std::time::Instant::now();
        let err = router
            .call(&DeviceId::new("d1"), RpcCall::new("c1", "forwardLogs"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
        assert!(
            started.elapsed() < Duration::from_millis(50),
            "enqueue must never block the caller"
        );
        // Overflow is fatal to the stalled connection.
        assert!(handle.close_requested().is_cancelled());
        assert!(handle.pending.is_empty(), "correlation entry discarded");
    }

    #[tokio::test]
    async fn serve_bus_call_naks_on_full_queue() {
        let registry = Arc::new(DeviceRegistry::new());
        let (channel, _rx) = DuplexChannel::new(1);
        let handle = Arc::new(DeviceHandle::new(DeviceId::new("d1"), channel));
        let _ = registry.register(Arc::clone(&handle));
        handle
            .channel
            .send_call(RpcCall::new("fill", "forwardLogs"))
            .unwrap();

        let payload = serde_json::to_vec(&RpcCall::new("c1", "forwardLogs")).unwrap();
        let started = std::time::Instant::now();
        let reply = serve_bus_call(&handle, &payload, Duration::from_secs(5)).await;
        assert!(reply.is_empty(), "overflow replies NAK");
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(handle.close_requested().is_cancelled());
    }

    #[tokio::test]
    async fn disconnect_mid_call_resolves_not_connected() {
        let registry = Arc::new(DeviceRegistry::new());
        let (handle, _rx) = connect_device(&registry, "d1");

        let router = Arc::new(CallRouter::new(Arc::clone(&registry), None, quick_config()));
        let caller = Arc::clone(&router);
        let call_task = tokio::spawn(async move {
            caller
                .call(&DeviceId::new("d1"), RpcCall::new("1", "forwardLogs"))
                .await
        });

        // Give the call time to enqueue, then disconnect the device.
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.unregister(&handle);

        let err = call_task.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
    }

    /// Bus that always times out, counting attempts.
    struct TimeoutBus {
        requests: AtomicU32,
    }

    #[async_trait]
    impl MessageBus for TimeoutBus {
        async fn request(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
            _timeout: Duration,
        ) -> Result<Vec<u8>, BusError> {
            let _ = self.requests.fetch_add(1, Ordering::SeqCst);
            Err(BusError::Timeout)
        }

        fn subscribe(&self, _topic: &str, _handler: BusHandler) -> Subscription {
            Subscription::new(|| {})
        }
    }

    #[tokio::test]
    async fn bus_timeout_retried_exactly_max_times() {
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(TimeoutBus {
            requests: AtomicU32::new(0),
        });
        let router = CallRouter::new(registry, Some(Arc::clone(&bus) as _), quick_config());

        let err = router
            .call(&DeviceId::new("remote"), RpcCall::new("1", "forwardLogs"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout));
        assert_eq!(bus.requests.load(Ordering::SeqCst), 3, "bound=3 means 3 attempts");
    }

    /// Bus that NAKs a fixed number of times, then answers.
    struct NakThenAnswerBus {
        naks_remaining: AtomicU32,
        requests: AtomicU32,
    }

    #[async_trait]
    impl MessageBus for NakThenAnswerBus {
        async fn request(
            &self,
            _topic: &str,
            payload: Vec<u8>,
            _timeout: Duration,
        ) -> Result<Vec<u8>, BusError> {
            let _ = self.requests.fetch_add(1, Ordering::SeqCst);
            if self
                .naks_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(Vec::new());
            }
            let call: RpcCall = serde_json::from_slice(&payload).unwrap();
            Ok(serde_json::to_vec(&RpcResponse::success(call.id, json!({"ok": true}))).unwrap())
        }

        fn subscribe(&self, _topic: &str, _handler: BusHandler) -> Subscription {
            Subscription::new(|| {})
        }
    }

    #[tokio::test]
    async fn naks_do_not_consume_retry_budget() {
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(NakThenAnswerBus {
            naks_remaining: AtomicU32::new(3),
            requests: AtomicU32::new(0),
        });
        let router = CallRouter::new(registry, Some(Arc::clone(&bus) as _), quick_config());

        // NAK, NAK, NAK, success under max_retries=3 still succeeds.
        let resp = router
            .call(&DeviceId::new("remote"), RpcCall::new("1", "forwardLogs"))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
        assert_eq!(bus.requests.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn nak_retries_bounded_by_overall_deadline() {
        struct AlwaysNakBus;

        #[async_trait]
        impl MessageBus for AlwaysNakBus {
            async fn request(
                &self,
                _topic: &str,
                _payload: Vec<u8>,
                _timeout: Duration,
            ) -> Result<Vec<u8>, BusError> {
                Ok(Vec::new())
            }

            fn subscribe(&self, _topic: &str, _handler: BusHandler) -> Subscription {
                Subscription::new(|| {})
            }
        }

        let registry = Arc::new(DeviceRegistry::new());
        let config = RouterConfig {
            local_call_timeout: Duration::from_millis(50),
            nak_backoff: Duration::from_millis(5),
            ..quick_config()
        };
        let router = CallRouter::new(registry, Some(Arc::new(AlwaysNakBus) as _), config);

        let err = router
            .call(&DeviceId::new("remote"), RpcCall::new("1", "forwardLogs"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout));
    }

    #[tokio::test]
    async fn no_responders_fails_as_not_connected_without_retry() {
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(InProcessBus::new());
        let router = CallRouter::new(registry, Some(bus as _), quick_config());

        let started = std::time::Instant::now();
        let err = router
            .call(&DeviceId::new("nowhere"), RpcCall::new("1", "forwardLogs"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn bridged_call_round_trip_over_in_process_bus() {
        // Instance A holds the device; instance B issues the call.
        let bus = Arc::new(InProcessBus::new());

        let registry_a = Arc::new(DeviceRegistry::new());
        let router_a = CallRouter::new(
            Arc::clone(&registry_a),
            Some(Arc::clone(&bus) as _),
            quick_config(),
        );
        let (handle, rx) = connect_device(&registry_a, "d1");
        router_a.attach_bus_subscription(&handle);
        spawn_device_echo(Arc::clone(&handle), rx);

        let registry_b = Arc::new(DeviceRegistry::new());
        let router_b = CallRouter::new(registry_b, Some(Arc::clone(&bus) as _), quick_config());

        let resp = router_b
            .call(&DeviceId::new("d1"), RpcCall::new("42", "forwardLogs"))
            .await
            .unwrap();
        assert_eq!(resp.id, "42");
        assert_eq!(resp.result.unwrap()["success"], true);
    }

    #[tokio::test]
    async fn serve_bus_call_naks_on_closed_channel() {
        let registry = Arc::new(DeviceRegistry::new());
        let (handle, _rx) = connect_device(&registry, "d1");
        registry.unregister(&handle);

        let payload = serde_json::to_vec(&RpcCall::new("1", "forwardLogs")).unwrap();
        let reply = serve_bus_call(&handle, &payload, Duration::from_millis(50)).await;
        assert!(reply.is_empty(), "closed channel replies NAK");
    }

    #[tokio::test]
    async fn serve_bus_call_naks_on_garbage_payload() {
        let registry = Arc::new(DeviceRegistry::new());
        let (handle, _rx) = connect_device(&registry, "d1");
        let reply = serve_bus_call(&handle, b"garbage", Duration::from_millis(50)).await;
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn serve_bus_call_naks_on_local_timeout() {
        let registry = Arc::new(DeviceRegistry::new());
        // Device never answers.
        let (handle, _rx) = connect_device(&registry, "d1");
        let payload = serde_json::to_vec(&RpcCall::new("1", "forwardLogs")).unwrap();
        let reply = serve_bus_call(&handle, &payload, Duration::from_millis(20)).await;
        assert!(reply.is_empty());
        assert!(handle.pending.is_empty(), "entry abandoned after timeout");
    }

    #[tokio::test]
    async fn subscription_gone_after_disconnect_yields_no_responders() {
        let bus = Arc::new(InProcessBus::new());
        let registry = Arc::new(DeviceRegistry::new());
        let router = CallRouter::new(
            Arc::clone(&registry),
            Some(Arc::clone(&bus) as _),
            quick_config(),
        );

        let (handle, _rx) = connect_device(&registry, "d1");
        router.attach_bus_subscription(&handle);
        assert_eq!(bus.subscription_count(), 1);

        registry.unregister(&handle);
        assert_eq!(
            bus.subscription_count(),
            0,
            "bus subscription tracks connection existence exactly"
        );
    }

    #[test]
    fn long_method_timeout_table() {
        let config = RouterConfig::default();
        assert_eq!(
            config.bus_timeout_for("takeSnapshot"),
            Duration::from_secs(30)
        );
        assert_eq!(config.bus_timeout_for("forwardLogs"), Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.local_call_timeout, Duration::from_secs(120));
        assert_eq!(config.remote_call_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn concurrent_local_calls_interleaved_responses() {
        let registry = Arc::new(DeviceRegistry::new());
        let (handle, mut rx) = connect_device(&registry, "d1");

        // Device task: collect all calls first, then answer in reverse.
        let answerer = Arc::clone(&handle);
        let n = 8usize;
        let device = tokio::spawn(async move {
            let mut calls = Vec::new();
            for _ in 0..n {
                calls.push(rx.calls.recv().await.unwrap());
            }
            calls.reverse();
            for call in calls {
                let echo = call.id.clone();
                let _ = answerer
                    .pending
                    .fulfill(RpcResponse::success(call.id, json!({"echo": echo})));
            }
        });

        let router = Arc::new(CallRouter::new(registry, None, quick_config()));
        let mut tasks = Vec::new();
        for i in 0..n {
            let router = Arc::clone(&router);
            tasks.push(tokio::spawn(async move {
                let resp = router
                    .call(
                        &DeviceId::new("d1"),
                        RpcCall::new(format!("c{i}"), "forwardLogs"),
                    )
                    .await
                    .unwrap();
                assert_eq!(resp.result.unwrap()["echo"], format!("c{i}"));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        device.await.unwrap();
    }
}

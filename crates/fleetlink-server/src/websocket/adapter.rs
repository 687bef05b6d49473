//! WebSocket transport adapter.
//!
//! Owns one connection's lifecycle: upgrade, registration, the read and
//! write loops, and exactly-once teardown when the read loop exits.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use fleetlink_bridge::metrics::{
    record_error, BRIDGE_CONNECTIONS_ACTIVE, BRIDGE_CONNECTIONS_TOTAL, BRIDGE_DISCONNECTS_TOTAL,
};
use fleetlink_bridge::{DeviceHandle, DuplexChannel};
use fleetlink_core::{classify, BridgeError, DeviceId, DeviceMessage, RpcCall, RpcResponse};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::AppState;

/// Device-initiated methods the server acknowledges itself.
const ACKED_METHODS: &[&str] = &["forwardLogs", "storeStats"];

/// GET /ws/{device_id}: screen the origin, then upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.origin_policy.permits(origin) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let device_id = DeviceId::new(device_id);
    ws.on_upgrade(move |socket| handle_socket(socket, device_id, state))
}

/// Drive one device connection to completion.
async fn handle_socket(socket: WebSocket, device_id: DeviceId, state: AppState) {
    info!(device_id = %device_id, "device connected");
    counter!(BRIDGE_CONNECTIONS_TOTAL).increment(1);
    gauge!(BRIDGE_CONNECTIONS_ACTIVE).increment(1.0);

    let (channel, receivers) = DuplexChannel::new(state.config.queue_capacity);
    let handle = Arc::new(DeviceHandle::new(device_id.clone(), channel));
    // Replace-and-close-old: a displaced handle is finalized here and
    // its own read loop unregisters it as a no-op later.
    let _ = state.router.registry().register(Arc::clone(&handle));
    state.router.attach_bus_subscription(&handle);

    let (sink, stream) = socket.split();
    let (wire_tx, wire_rx) = mpsc::channel::<Message>(state.config.queue_capacity);

    let writer = tokio::spawn(write_loop(
        sink,
        wire_rx,
        handle.close_requested(),
        state.config.ping_interval(),
    ));
    let forwarder = tokio::spawn(forward_calls(
        receivers.calls,
        wire_tx.clone(),
        Arc::clone(&handle),
    ));
    let dispatcher = tokio::spawn(dispatch_responses(receivers.responses, Arc::clone(&handle)));

    read_loop(stream, &handle, &wire_tx).await;

    // Exactly-once teardown, identity-aware against a replacement.
    state.router.registry().unregister(&handle);
    forwarder.abort();
    dispatcher.abort();
    drop(wire_tx);
    let _ = writer.await;

    gauge!(BRIDGE_CONNECTIONS_ACTIVE).decrement(1.0);
    counter!(BRIDGE_DISCONNECTS_TOTAL).increment(1);
    info!(device_id = %device_id, "device disconnected");
}

/// Sole writer to the socket: outgoing frames, periodic pings, and the
/// close frame when a drain or replacement requests it.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut wire_rx: mpsc::Receiver<Message>,
    close_requested: CancellationToken,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it.
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            () = close_requested.cancelled() => {
                let frame = CloseFrame {
                    code: close_code::RESTART,
                    reason: Utf8Bytes::from_static("service restarting"),
                };
                if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                    debug!(error = %err, "close frame not delivered");
                }
                break;
            }
            msg = wire_rx.recv() => {
                let Some(msg) = msg else { break };
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Enqueue a frame for the writer without blocking.
///
/// A full wire queue means the socket has stalled behind a slow or dead
/// peer; the connection is closed rather than letting producers back up
/// behind it. Returns `false` once the connection is done for.
fn enqueue_wire(
    handle: &Arc<DeviceHandle>,
    wire_tx: &mpsc::Sender<Message>,
    msg: Message,
) -> bool {
    match wire_tx.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            record_error(handle.device_id(), "overflow");
            warn!(device_id = %handle.device_id(), "wire queue overflow, closing connection");
            handle.request_close();
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Drain server→device calls from the duplex channel onto the wire.
async fn forward_calls(
    mut calls: mpsc::Receiver<RpcCall>,
    wire_tx: mpsc::Sender<Message>,
    handle: Arc<DeviceHandle>,
) {
    while let Some(call) = calls.recv().await {
        let text = match serde_json::to_string(&call) {
            Ok(text) => text,
            Err(err) => {
                record_error(handle.device_id(), "marshal");
                warn!(device_id = %handle.device_id(), error = %err, "unserializable call dropped");
                continue;
            }
        };
        if !enqueue_wire(&handle, &wire_tx, Message::Text(text.into())) {
            break;
        }
    }
}

/// Drain device→server responses into the correlation map.
async fn dispatch_responses(mut responses: mpsc::Receiver<RpcResponse>, handle: Arc<DeviceHandle>) {
    while let Some(response) = responses.recv().await {
        let _ = handle.pending.fulfill(response);
    }
}

/// Consume frames until the peer closes or errors.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    handle: &Arc<DeviceHandle>,
    wire_tx: &mpsc::Sender<Message>,
) {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!(device_id = %handle.device_id(), error = %err, "read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                // App-level keepalive used by older device firmware.
                if text.as_str() == "ping" {
                    let _ = enqueue_wire(
                        handle,
                        wire_tx,
                        Message::Text(Utf8Bytes::from_static("PONG")),
                    );
                    continue;
                }
                handle_payload(handle, wire_tx, text.as_bytes());
            }
            Message::Binary(bytes) => handle_payload(handle, wire_tx, &bytes),
            // Protocol pings are answered by the stack; pongs need no action.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }
}

/// Classify one inbound payload and route it.
///
/// Unclassifiable payloads are logged, counted, and dropped; they never
/// terminate the connection.
fn handle_payload(handle: &Arc<DeviceHandle>, wire_tx: &mpsc::Sender<Message>, payload: &[u8]) {
    match classify(payload) {
        Ok(DeviceMessage::Response(response)) => {
            match handle.channel.push_response(response) {
                Ok(()) => {}
                Err(BridgeError::QueueFull) => {
                    record_error(handle.device_id(), "overflow");
                    warn!(device_id = %handle.device_id(), "response queue overflow, closing connection");
                    handle.request_close();
                }
                Err(_) => {
                    debug!(device_id = %handle.device_id(), "response after close dropped");
                }
            }
        }
        Ok(DeviceMessage::Call(call)) => serve_device_call(handle, wire_tx, call),
        Err(err) => {
            record_error(handle.device_id(), err.category());
            warn!(device_id = %handle.device_id(), error = %err, "unclassifiable payload dropped");
        }
    }
}

/// Answer a device-initiated call.
///
/// Known methods are acknowledged with `{"success": true}`; the log and
/// stats payloads themselves are fire-and-forget. Unknown methods are
/// counted and dropped without a reply.
fn serve_device_call(handle: &Arc<DeviceHandle>, wire_tx: &mpsc::Sender<Message>, call: RpcCall) {
    if !ACKED_METHODS.contains(&call.method.as_str()) {
        record_error(handle.device_id(), "unknown_method");
        warn!(device_id = %handle.device_id(), method = %call.method, "unknown device method dropped");
        return;
    }
    debug!(device_id = %handle.device_id(), method = %call.method, "device call acknowledged");
    let ack = RpcResponse::success(call.id, json!({"success": true}));
    match serde_json::to_string(&ack) {
        Ok(text) => {
            let _ = enqueue_wire(handle, wire_tx, Message::Text(text.into()));
        }
        Err(err) => {
            record_error(handle.device_id(), "marshal");
            warn!(device_id = %handle.device_id(), error = %err, "unserializable ack");
        }
    }
}

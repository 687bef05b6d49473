//! Per-connection duplex call channel.

use std::sync::atomic::{AtomicBool, Ordering};

use fleetlink_core::{BridgeError, RpcCall, RpcResponse};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default capacity of each directional queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Send side of one connected device's duplex channel.
///
/// Inbound carries server→device calls toward the transport write loop;
/// outbound carries device→server responses toward the correlation
/// dispatch task. The open flag transitions to `false` exactly once, in
/// the disconnect handler, before the queues are torn down, so a
/// producer racing a disconnect observes a typed rejection, never a
/// send on a closed queue.
pub struct DuplexChannel {
    open: AtomicBool,
    calls_tx: mpsc::Sender<RpcCall>,
    responses_tx: mpsc::Sender<RpcResponse>,
}

/// Receive side, taken by the per-connection tasks.
pub struct DuplexReceivers {
    /// Server→device calls, drained to the wire by the transport.
    pub calls: mpsc::Receiver<RpcCall>,
    /// Device→server responses, drained by the dispatch task.
    pub responses: mpsc::Receiver<RpcResponse>,
}

impl DuplexChannel {
    /// Create a channel pair with the given per-queue capacity.
    pub fn new(capacity: usize) -> (Self, DuplexReceivers) {
        let (calls_tx, calls) = mpsc::channel(capacity);
        let (responses_tx, responses) = mpsc::channel(capacity);
        (
            Self {
                open: AtomicBool::new(true),
                calls_tx,
                responses_tx,
            },
            DuplexReceivers { calls, responses },
        )
    }

    /// Whether the connection is still accepting traffic.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Enqueue a server→device call.
    ///
    /// Never blocks: a full queue means the connection has stalled and
    /// is reported as [`BridgeError::QueueFull`], which the producer
    /// treats as fatal to that one connection.
    pub fn send_call(&self, call: RpcCall) -> Result<(), BridgeError> {
        if !self.is_open() {
            return Err(BridgeError::ChannelClosed);
        }
        self.calls_tx.try_send(call).map_err(|err| match err {
            TrySendError::Full(_) => BridgeError::QueueFull,
            TrySendError::Closed(_) => BridgeError::ChannelClosed,
        })
    }

    /// Enqueue a device→server response. Never blocks; see [`Self::send_call`].
    pub fn push_response(&self, response: RpcResponse) -> Result<(), BridgeError> {
        if !self.is_open() {
            return Err(BridgeError::ChannelClosed);
        }
        self.responses_tx.try_send(response).map_err(|err| match err {
            TrySendError::Full(_) => BridgeError::QueueFull,
            TrySendError::Closed(_) => BridgeError::ChannelClosed,
        })
    }

    /// Mark the channel closed.
    ///
    /// Returns `true` for the call that performed the transition, so the
    /// close happens exactly once even when disconnect and replacement
    /// race. Queue teardown follows when the receiving tasks exit.
    pub fn close(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }
}

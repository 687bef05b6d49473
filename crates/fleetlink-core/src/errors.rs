//! Error types surfaced by the RPC bridge.

/// Failure of a single bridged or local call.
///
/// No variant is fatal to the process; recovery is local to one call or
/// one connection.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No reachable connection for the device, locally or over the bus.
    #[error("device not connected")]
    NotConnected,

    /// The local or bus deadline elapsed before a response arrived.
    #[error("call timed out")]
    Timeout,

    /// The connection's channel closed while the call was being sent.
    #[error("connection channel closed")]
    ChannelClosed,

    /// A bounded per-connection queue overflowed. The connection is
    /// stalled and gets closed; enqueueing never blocks the producer.
    #[error("connection queue overflow")]
    QueueFull,

    /// Bus-level failure that is not a plain timeout.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// A call or response could not be (de)serialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Failure of one pub/sub request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The request timed out waiting for a reply.
    #[error("bus request timed out")]
    Timeout,

    /// No instance is subscribed to the topic.
    #[error("no responders on topic {0}")]
    NoResponders(String),

    /// The bus itself is shut down.
    #[error("bus closed")]
    Closed,
}

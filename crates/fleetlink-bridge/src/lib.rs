//! # fleetlink-bridge
//!
//! The instance-local and cross-instance RPC routing core:
//! - `DuplexChannel`: per-connection directional call/response queues
//! - `PendingCalls`: call-id → one-shot correlation map
//! - `DeviceRegistry`: device identity → live connection handle
//! - `MessageBus` seam + `InProcessBus`: pub/sub request/reply bridge
//! - `CallRouter`: local-first call delivery with bus fallback
//! - `drain`: bounded-wait close of every local connection on restart

#![deny(unsafe_code)]

pub mod bus;
pub mod channel;
pub mod correlation;
pub mod drain;
pub mod metrics;
pub mod registry;
pub mod router;

pub use bus::{BusHandler, InProcessBus, MessageBus, Subscription};
pub use channel::{DuplexChannel, DuplexReceivers};
pub use correlation::PendingCalls;
pub use drain::drain_all;
pub use registry::{DeviceHandle, DeviceRegistry};
pub use router::{CallRouter, RouterConfig};

//! # fleetlink-core
//!
//! Wire types and errors shared across the fleetlink RPC bridge:
//! - `RpcCall` / `RpcResponse` JSON-RPC wire shapes
//! - Shape-based classification of device payloads into a tagged union
//! - `DeviceId` identity newtype
//! - `BridgeError` / `BusError` error types

#![deny(unsafe_code)]

pub mod device;
pub mod errors;
pub mod rpc;

pub use device::DeviceId;
pub use errors::{BridgeError, BusError};
pub use rpc::{classify, ClassifyError, DeviceMessage, RpcCall, RpcResponse, JSONRPC_VERSION};

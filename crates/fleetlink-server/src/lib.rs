//! # fleetlink-server
//!
//! Axum HTTP + WebSocket surface of the bridge: the transport adapter
//! behind `GET /ws/{device_id}`, browser origin screening, Prometheus
//! metrics, and drain-then-stop shutdown.

#![deny(unsafe_code)]

pub mod config;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{BridgeConfig, ConfigError};
pub use server::{AppState, BridgeServer, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use websocket::OriginPolicy;

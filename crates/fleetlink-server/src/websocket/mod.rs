//! WebSocket transport: origin screening, upgrade, read/write loops.

pub mod adapter;
pub mod origin;

pub use adapter::ws_handler;
pub use origin::OriginPolicy;

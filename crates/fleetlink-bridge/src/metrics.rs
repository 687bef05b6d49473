//! Metric name constants and recording helpers for the bridge.

use fleetlink_core::DeviceId;
use metrics::counter;

/// Active device connections on this instance (gauge).
pub const BRIDGE_CONNECTIONS_ACTIVE: &str = "bridge_connections_active";
/// Device connections opened total (counter).
pub const BRIDGE_CONNECTIONS_TOTAL: &str = "bridge_connections_total";
/// Device disconnections total (counter).
pub const BRIDGE_DISCONNECTS_TOTAL: &str = "bridge_disconnects_total";
/// Bridge errors total (counter, labels: device_id, category).
pub const BRIDGE_ERRORS_TOTAL: &str = "bridge_errors_total";
/// Calls routed total (counter, labels: transport = local | bus).
pub const BRIDGE_CALLS_TOTAL: &str = "bridge_calls_total";
/// NAK retries total (counter): soft bus rejections, no budget consumed.
pub const BRIDGE_NAK_RETRIES_TOTAL: &str = "bridge_nak_retries_total";

/// Record one bridge error for a device.
///
/// Categories: `unmarshal`, `marshal`, `protocol`, `timeout`,
/// `unknown_method`, `nak`, `overflow`.
pub fn record_error(device_id: &DeviceId, category: &'static str) {
    counter!(
        BRIDGE_ERRORS_TOTAL,
        "device_id" => device_id.to_string(),
        "category" => category
    )
    .increment(1);
}

/// Record one routed call.
pub fn record_call(transport: &'static str) {
    counter!(BRIDGE_CALLS_TOTAL, "transport" => transport).increment(1);
}

//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Register the process-wide Prometheus recorder.
///
/// Call exactly once during startup, before the first counter or gauge
/// fires; the returned handle is what `/metrics` renders from.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Snapshot the recorder in Prometheus exposition format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

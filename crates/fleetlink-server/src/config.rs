//! Bridge server configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use fleetlink_bridge::RouterConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the bridge server.
///
/// Every field has a default, so a config file only needs the fields it
/// changes. `FLEETLINK_HOST`, `FLEETLINK_PORT` and
/// `FLEETLINK_ALLOWED_ORIGINS` env vars override the file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `4040`; `0` auto-assigns).
    pub port: u16,
    /// Origin suffixes allowed for browser connections, e.g.
    /// `".example.com"`. Requests without an `Origin` header are always
    /// accepted; with an empty list, every browser origin is rejected.
    pub allowed_origins: Vec<String>,
    /// Capacity of each per-connection directional queue.
    pub queue_capacity: usize,
    /// Interval between server pings on idle connections, in seconds.
    pub ping_interval_secs: u64,
    /// How long a locally delivered call may wait for its response.
    pub local_call_timeout_secs: u64,
    /// How long the holding instance waits when serving a bridged call.
    pub remote_call_timeout_secs: u64,
    /// Per-attempt bus request timeout, in seconds.
    pub bus_timeout_secs: u64,
    /// Per-method bus timeout overrides for long-running calls.
    pub long_method_timeouts_secs: HashMap<String, u64>,
    /// Attempts allowed on bus-level timeout.
    pub max_retries: u32,
    /// Pause between NAK retries, in milliseconds.
    pub nak_backoff_ms: u64,
    /// Per-connection close wait during drain, in seconds.
    pub drain_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let mut long_method_timeouts_secs = HashMap::new();
        let _ = long_method_timeouts_secs.insert("takeSnapshot".to_owned(), 30);
        Self {
            host: "0.0.0.0".into(),
            port: 4040,
            allowed_origins: Vec::new(),
            queue_capacity: 32,
            ping_interval_secs: 30,
            local_call_timeout_secs: 120,
            remote_call_timeout_secs: 30,
            bus_timeout_secs: 5,
            long_method_timeouts_secs,
            max_retries: 3,
            nak_backoff_ms: 100,
            drain_timeout_secs: 5,
        }
    }
}

/// Why configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeConfig {
    /// Load from a JSON file, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&contents)?;
        config.apply_env();
        Ok(config)
    }

    /// Apply `FLEETLINK_*` env var overrides.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("FLEETLINK_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("FLEETLINK_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(origins) = std::env::var("FLEETLINK_ALLOWED_ORIGINS") {
            self.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
    }

    /// The router's view of this configuration.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            local_call_timeout: Duration::from_secs(self.local_call_timeout_secs),
            remote_call_timeout: Duration::from_secs(self.remote_call_timeout_secs),
            bus_timeout: Duration::from_secs(self.bus_timeout_secs),
            long_method_timeouts: self
                .long_method_timeouts_secs
                .iter()
                .map(|(method, secs)| (method.clone(), Duration::from_secs(*secs)))
                .collect(),
            max_retries: self.max_retries,
            nak_backoff: Duration::from_millis(self.nak_backoff_ms),
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

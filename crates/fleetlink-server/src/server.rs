//! `BridgeServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use fleetlink_bridge::{CallRouter, DeviceRegistry, MessageBus};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::BridgeConfig;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{ws_handler, OriginPolicy};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub router: Arc<CallRouter>,
    pub origin_policy: OriginPolicy,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
}

/// The bridge server: transport endpoint plus health and metrics.
pub struct BridgeServer {
    config: Arc<BridgeConfig>,
    registry: Arc<DeviceRegistry>,
    router: Arc<CallRouter>,
    origin_policy: OriginPolicy,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl BridgeServer {
    /// Create a server. `bus: None` disables cross-instance bridging.
    pub fn new(config: BridgeConfig, bus: Option<Arc<dyn MessageBus>>) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let router = Arc::new(CallRouter::new(
            Arc::clone(&registry),
            bus,
            config.router_config(),
        ));
        let origin_policy = OriginPolicy::new(&config.allowed_origins);
        Self {
            config: Arc::new(config),
            registry,
            router,
            origin_policy,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Attach the handle that renders the `/metrics` endpoint.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The call router, for issuing calls to connected devices.
    pub fn router(&self) -> &Arc<CallRouter> {
        &self.router
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Build the Axum router with all routes.
    pub fn app(&self) -> Router {
        let state = AppState {
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            origin_policy: self.origin_policy.clone(),
            shutdown: Arc::clone(&self.shutdown),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };
        Router::new()
            .route("/ws/{device_id}", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until shutdown. Returns once the listener is up.
    pub async fn listen(&self) -> Result<ServerHandle, std::io::Error> {
        let app = self.app();
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "bridge server listening");

        let token = self.shutdown.token();
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                tracing::error!(error = %err, "server error");
            }
        });
        Ok(ServerHandle {
            addr: local_addr,
            task,
        })
    }

    /// Drain every device connection, then stop the listener.
    pub async fn drain_and_stop(&self) {
        self.shutdown
            .drain_and_stop(&self.registry, self.config.drain_timeout())
            .await;
    }
}

/// Handle for a bound, serving listener.
pub struct ServerHandle {
    pub addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the serve task to finish (after graceful shutdown).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    connections: usize,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        connections: state.router.registry().len(),
    })
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, crate::metrics::render(handle)),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

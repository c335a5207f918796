//! `BurrowServer`: the axum HTTP front of the tunnel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::health::HealthResponse;
use crate::session::SessionGate;
use crate::shutdown::ShutdownCoordinator;
use crate::tunnel::{CorrelationRegistry, proxy};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Pending requests and the broker link.
    pub registry: Arc<CorrelationRegistry>,
    /// Session gate, when an auth provider is configured.
    pub sessions: Option<Arc<SessionGate>>,
    /// HTTP-side configuration.
    pub config: Arc<ServerConfig>,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// A running listener.
#[derive(Debug)]
pub struct ServerHandle {
    /// Bound address (useful when the configured port is 0).
    pub addr: SocketAddr,
    /// The serve task; finishes after shutdown drains connections.
    pub task: JoinHandle<()>,
}

/// The tunnel's HTTP server.
pub struct BurrowServer {
    config: Arc<ServerConfig>,
    registry: Arc<CorrelationRegistry>,
    sessions: Option<Arc<SessionGate>>,
    metrics: Option<PrometheusHandle>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl BurrowServer {
    /// Create a server over `registry`.
    pub fn new(config: ServerConfig, registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            sessions: None,
            metrics: None,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Gate requests carrying a bearer token through `gate`.
    #[must_use]
    pub fn with_sessions(mut self, gate: Arc<SessionGate>) -> Self {
        self.sessions = Some(gate);
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Share an existing shutdown coordinator.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownCoordinator>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Build the router: built-in routes plus the proxy fallback.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .fallback(proxy::proxy)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the correlation registry.
    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen(&self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();
        info!(%addr, "http server listening");

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            match served {
                Ok(()) => info!("http server stopped"),
                Err(e) => error!(error = %e, "http server failed"),
            }
        });
        Ok(ServerHandle { addr, task })
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::snapshot(
        state.start_time,
        &state.registry,
        state.sessions.as_deref(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn make_server() -> BurrowServer {
        BurrowServer::new(ServerConfig::default(), Arc::new(CorrelationRegistry::new()))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_degraded_without_broker() {
        let app = make_server().router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "degraded");
        assert_eq!(parsed["broker_connected"], false);
        assert_eq!(parsed["pending_requests"], 0);
        assert_eq!(parsed["sessions"], 0);
    }

    #[tokio::test]
    async fn metrics_absent_without_recorder() {
        let app = make_server().router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn proxy_without_broker_is_unavailable() {
        let server = make_server();
        let app = server.router();
        let req = Request::builder()
            .uri("/dev1/status")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["code"], "BROKER_DISCONNECTED");
        assert_eq!(server.registry().pending_count(), 0);
    }

    #[tokio::test]
    async fn upgrade_rejected() {
        let app = make_server().router();
        let req = Request::builder()
            .uri("/dev1/ws")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "UPGRADE_NOT_SUPPORTED");
    }

    #[tokio::test]
    async fn path_without_resource_rejected() {
        let app = make_server().router();
        let req = Request::builder().uri("/dev1").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_rejected() {
        let config = ServerConfig {
            max_body_bytes: 4,
            ..ServerConfig::default()
        };
        let app = BurrowServer::new(config, Arc::new(CorrelationRegistry::new())).router();
        let req = Request::builder()
            .method("POST")
            .uri("/dev1/upload")
            .body(Body::from("far too long"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let server = make_server();
        let handle = server.listen().await.unwrap();
        assert!(handle.addr.ip().is_loopback());
        assert_ne!(handle.addr.port(), 0);

        server.shutdown().shutdown();
        handle.task.await.unwrap();
    }
}

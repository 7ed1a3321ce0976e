//! `GatewayServer`: Axum router, listener and lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tagbridge_core::{ConnectionId, DeviceTag};
use tagbridge_queue::MessageQueue;
use tagbridge_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::health::{self, HealthResponse};
use crate::registry::ConnectionRegistry;
use crate::session::{self, SessionContext};
use crate::shutdown::ShutdownSequence;
use crate::subscriptions::SubscriptionManager;

/// Query parameter carrying the device tag on the upgrade request.
pub const DEVICE_TAG_PARAM: &str = "deviceTag";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
struct AppState {
    session: SessionContext,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

/// The device gateway server.
pub struct GatewayServer {
    settings: ServerSettings,
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    shutdown: Arc<ShutdownSequence>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl GatewayServer {
    /// Create a server bridging device sockets to `queue`.
    pub fn new(settings: ServerSettings, queue: Arc<dyn MessageQueue>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let subscriptions = Arc::new(SubscriptionManager::new(queue, Arc::clone(&registry)));
        Self {
            settings,
            registry,
            shutdown: Arc::new(ShutdownSequence::new(Arc::clone(&subscriptions))),
            subscriptions,
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            session: SessionContext {
                registry: Arc::clone(&self.registry),
                subscriptions: Arc::clone(&self.subscriptions),
                send_queue_capacity: self.settings.send_queue_capacity.max(1),
                validate_actions: self.settings.validate_actions,
                shutdown: self.shutdown.token(),
            },
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.settings.endpoint, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the listener and serve in the background.
    ///
    /// Port `0` auto-assigns. The returned task ends after shutdown has been
    /// triggered and the broker subscriptions have been torn down. Hand it to
    /// [`ShutdownSequence::run`] to bound the drain.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener =
            TcpListener::bind((self.settings.host.as_str(), self.settings.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, endpoint = %self.settings.endpoint, "gateway listening");

        let app = self.router();
        let token = self.shutdown.token();
        let sequence = Arc::clone(&self.shutdown);
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server error");
            }
            let _ = sequence.teardown_broker().await;
            info!("gateway stopped");
        });
        Ok((addr, handle))
    }

    /// Open sockets by tag.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Subscription refcounting.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Stop sequence.
    pub fn shutdown(&self) -> &Arc<ShutdownSequence> {
        &self.shutdown
    }

    /// Listener settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// GET <endpoint>?deviceTag=...
async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(error = %rejection, "rejected non-websocket request");
            return rejection.into_response();
        }
    };
    let tag = DeviceTag::from_query(params.get(DEVICE_TAG_PARAM).map(String::as_str));
    let ctx = state.session;
    ws.on_upgrade(move |socket| async move {
        match tag {
            Ok(tag) => session::run_device_session(socket, tag, ConnectionId::new(), ctx).await,
            Err(e) => session::reject_session(socket, &e).await,
        }
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let ctx = &state.session;
    Json(health::health_check(
        state.start_time,
        ctx.registry.connection_count().await,
        ctx.registry.tag_count().await,
        ctx.subscriptions.subscription_count().await,
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tagbridge_queue::testing::RecordingQueue;
    use tower::ServiceExt;

    fn make_server() -> GatewayServer {
        GatewayServer::new(ServerSettings::default(), Arc::new(RecordingQueue::new()))
    }

    async fn get_path(app: Router, uri: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_reports_counters() {
        let server = make_server();
        let (status, body) = get_path(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["device_tags"], 0);
        assert_eq!(parsed["subscriptions"], 0);
    }

    #[tokio::test]
    async fn metrics_without_handle_is_404() {
        let server = make_server();
        let (status, _) = get_path(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_handle_renders() {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let server = make_server().with_metrics(handle);
        let (status, _) = get_path(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn plain_get_on_endpoint_is_rejected() {
        let server = make_server();
        let (status, _) = get_path(server.router(), "/deviceproxy?deviceTag=alpha").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let (status, _) = get_path(server.router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let queue = Arc::new(RecordingQueue::new());
        let settings = ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerSettings::default()
        };
        let server = GatewayServer::new(settings, queue.clone());
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.shutdown().trigger();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.shutdown_calls(), 1);
    }
}

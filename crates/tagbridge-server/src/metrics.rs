//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections accepted with a valid device tag (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Upgrades rejected for a missing device tag (counter).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Broker payloads queued on client sockets (counter).
pub const WS_FANOUT_MESSAGES_TOTAL: &str = "ws_fanout_messages_total";
/// Broker payloads dropped for a full or closed socket (counter).
pub const WS_FANOUT_DROPS_TOTAL: &str = "ws_fanout_drops_total";
/// Active broker subscriptions (gauge).
pub const BROKER_SUBSCRIPTIONS_ACTIVE: &str = "broker_subscriptions_active";
/// Client messages published to the broker (counter).
pub const BROKER_PUBLISHED_TOTAL: &str = "broker_published_total";
/// Broker operation failures (counter, labels: op).
pub const BROKER_ERRORS_TOTAL: &str = "broker_errors_total";

//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Proxied requests total (counter, labels: outcome).
pub const TUNNEL_REQUESTS_TOTAL: &str = "tunnel_requests_total";
/// Proxied request duration seconds (histogram).
pub const TUNNEL_REQUEST_DURATION_SECONDS: &str = "tunnel_request_duration_seconds";
/// Requests waiting for a device response (gauge).
pub const TUNNEL_PENDING_REQUESTS: &str = "tunnel_pending_requests";
/// Inbound messages dropped (counter, labels: reason).
pub const TUNNEL_DISCARDED_TOTAL: &str = "tunnel_discarded_total";
/// Successful broker connections total (counter).
pub const BROKER_CONNECTS_TOTAL: &str = "broker_connects_total";
/// Failed broker connection attempts total (counter).
pub const BROKER_CONNECT_FAILURES_TOTAL: &str = "broker_connect_failures_total";
/// Lost broker connections total (counter).
pub const BROKER_DISCONNECTS_TOTAL: &str = "broker_disconnects_total";
/// Broker connectivity (gauge). 1 = connected, 0 = disconnected.
pub const BROKER_CONNECTED: &str = "broker_connected";
/// Sessions created total (counter).
pub const SESSIONS_CREATED_TOTAL: &str = "sessions_created_total";
/// Sessions evicted for idleness total (counter).
pub const SESSIONS_EVICTED_TOTAL: &str = "sessions_evicted_total";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_from_local_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(TUNNEL_REQUESTS_TOTAL, "outcome" => "ok").increment(2);
        });
        let output = render(&handle);
        assert!(output.contains("tunnel_requests_total{outcome=\"ok\"} 2"));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            TUNNEL_REQUESTS_TOTAL,
            TUNNEL_REQUEST_DURATION_SECONDS,
            TUNNEL_PENDING_REQUESTS,
            TUNNEL_DISCARDED_TOTAL,
            BROKER_CONNECTS_TOTAL,
            BROKER_CONNECT_FAILURES_TOTAL,
            BROKER_DISCONNECTS_TOTAL,
            BROKER_CONNECTED,
            SESSIONS_CREATED_TOTAL,
            SESSIONS_EVICTED_TOTAL,
            SESSIONS_ACTIVE,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}

//! `/health` payload.

use std::time::Instant;

use serde::Serialize;

use crate::session::SessionGate;
use crate::tunnel::CorrelationRegistry;

/// Overall tunnel health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// A broker link is attached.
    Ok,
    /// HTTP is up but requests will get 503 until the broker reconnects.
    Degraded,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`.
    pub status: HealthStatus,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Whether a broker link is attached.
    pub broker_connected: bool,
    /// Requests waiting for a device response.
    pub pending_requests: usize,
    /// Cached sessions; zero without a session gate.
    pub sessions: usize,
}

impl HealthResponse {
    /// Snapshot the live tunnel state.
    pub fn snapshot(
        start_time: Instant,
        registry: &CorrelationRegistry,
        sessions: Option<&SessionGate>,
    ) -> Self {
        let broker_connected = registry.is_connected();
        Self {
            status: if broker_connected {
                HealthStatus::Ok
            } else {
                HealthStatus::Degraded
            },
            uptime_secs: start_time.elapsed().as_secs(),
            broker_connected,
            pending_requests: registry.pending_count(),
            sessions: sessions.map_or(0, SessionGate::len),
        }
    }
}

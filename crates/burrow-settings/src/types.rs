//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may name only the fields it changes.

use std::time::Duration;

use burrow_core::backoff::ReconnectPolicy;
use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "broker": { "address": "mqtt.example.net:1883", "username": "tunnel" },
///   "http": { "listenAddr": "0.0.0.0:80" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BurrowSettings {
    /// Broker connection.
    pub broker: BrokerSettings,
    /// Reconnect delay policy.
    pub reconnect: ReconnectPolicy,
    /// HTTP listener.
    pub http: HttpSettings,
    /// Request deadlines.
    pub tunnel: TunnelSettings,
    /// Session cache.
    pub session: SessionSettings,
    /// Permission lookup.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Broker connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// `host:port` of the broker.
    pub address: String,
    /// Login name.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Append a unique suffix to `client_id` on every connect, so a second
    /// tunnel instance does not take over the first one's session.
    pub fresh_client_id: bool,
    /// Ask the broker to discard any previous session state.
    pub clean_session: bool,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Give up on a connection attempt after this many seconds.
    pub connect_timeout_secs: u64,
    /// Capacity of the client's outbound request queue.
    pub channel_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            client_id: "tunnel".to_string(),
            fresh_client_id: true,
            clean_session: true,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            channel_capacity: 64,
        }
    }
}

impl BrokerSettings {
    /// Keep-alive as a [`Duration`].
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    /// Socket address to bind.
    pub listen_addr: String,
    /// Largest accepted request body. Bodies must fit one frame field.
    pub max_body_bytes: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            max_body_bytes: burrow_core::frame::MAX_FIELD_LEN,
        }
    }
}

/// Request deadline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelSettings {
    /// Deadline for an ungated request.
    pub request_timeout_ms: u64,
    /// Deadline for a request that passed the session gate.
    pub session_request_timeout_ms: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            session_request_timeout_ms: 30_000,
        }
    }
}

impl TunnelSettings {
    /// Ungated deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Gated deadline as a [`Duration`].
    pub fn session_request_timeout(&self) -> Duration {
        Duration::from_millis(self.session_request_timeout_ms)
    }
}

/// Session cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Sessions untouched for longer than this are evicted on the next
    /// creation.
    pub idle_timeout_secs: u64,
    /// Reject requests that carry no bearer token.
    pub require_session: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 5,
            require_session: false,
        }
    }
}

impl SessionSettings {
    /// Idle threshold as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Permission lookup settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Endpoint returning `{deviceId: capabilityBits}` for a bearer token.
    /// Session gating is off when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Timeout for one lookup.
    pub timeout_ms: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 5000,
        }
    }
}

impl AuthSettings {
    /// Lookup timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

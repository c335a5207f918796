//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use burrow_settings::{BurrowSettings, SettingsError};

/// Runtime configuration for the HTTP side of the tunnel.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind.
    pub listen_addr: SocketAddr,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Deadline for ungated requests.
    pub request_timeout: Duration,
    /// Deadline for requests that passed the session gate.
    pub session_request_timeout: Duration,
    /// Reject requests without a bearer token.
    pub require_session: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_body_bytes: burrow_core::frame::MAX_FIELD_LEN,
            request_timeout: Duration::from_secs(10),
            session_request_timeout: Duration::from_secs(30),
            require_session: false,
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &BurrowSettings) -> Result<Self, SettingsError> {
        let listen_addr = settings.http.listen_addr.parse().map_err(|_| {
            SettingsError::InvalidValue(format!(
                "http.listenAddr: {:?}",
                settings.http.listen_addr
            ))
        })?;
        Ok(Self {
            listen_addr,
            max_body_bytes: settings
                .http
                .max_body_bytes
                .min(burrow_core::frame::MAX_FIELD_LEN),
            request_timeout: settings.tunnel.request_timeout(),
            session_request_timeout: settings.tunnel.session_request_timeout(),
            require_session: settings.session.require_session,
        })
    }
}

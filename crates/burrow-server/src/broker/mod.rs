//! Pub/sub broker abstraction.
//!
//! The tunnel needs four things from a broker client: connect, subscribe,
//! publish, and pull the next inbound message. They are split across three
//! traits so the publishing half can be shared with request handlers while
//! the receive loop owns the inbound half exclusively.
//!
//! - [`mqtt::MqttConnector`]: MQTT 3.1.1 over TCP via `rumqttc`
//! - [`memory::MemoryBroker`]: in-process broker for tests and embedding
//! - [`manager::ConnectionManager`]: connect/receive/reconnect loop

pub mod manager;
pub mod memory;
pub mod mqtt;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use burrow_settings::{BurrowSettings, SettingsError, split_host_port};
use bytes::Bytes;
use thiserror::Error;

/// Broker client failure.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The configured address is not `host:port`.
    #[error("invalid broker address {0:?}")]
    InvalidAddress(String),
    /// Connecting or the handshake failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// A subscription was refused or could not be queued.
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    /// A publish could not be queued.
    #[error("publish failed: {0}")]
    Publish(String),
    /// The established connection failed.
    #[error("connection error: {0}")]
    Connection(String),
}

impl BrokerError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::Connect(_) => "CONNECT_FAILED",
            Self::Subscribe(_) => "SUBSCRIBE_FAILED",
            Self::Publish(_) => "PUBLISH_FAILED",
            Self::Connection(_) => "CONNECTION_ERROR",
        }
    }
}

/// Delivery guarantee requested for a subscription or publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QoS {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery, possibly duplicated.
    AtLeastOnce,
}

/// Login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Login password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parameters for one connection attempt.
#[derive(Clone, Debug)]
pub struct BrokerOptions {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier for this attempt.
    pub client_id: String,
    /// Discard previous session state on connect.
    pub clean_session: bool,
    /// Login, if any.
    pub credentials: Option<Credentials>,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Give up on the handshake after this long.
    pub connect_timeout: Duration,
    /// Outbound request queue capacity.
    pub channel_capacity: usize,
}

impl BrokerOptions {
    /// Build options from loaded settings.
    pub fn from_settings(settings: &BurrowSettings) -> Result<Self, SettingsError> {
        let broker = &settings.broker;
        let (host, port) = split_host_port(&broker.address).ok_or_else(|| {
            SettingsError::InvalidValue(format!("broker.address: {:?}", broker.address))
        })?;
        let credentials = (!broker.username.is_empty()).then(|| Credentials {
            username: broker.username.clone(),
            password: broker.password.clone(),
        });
        Ok(Self {
            host: host.to_string(),
            port,
            client_id: broker.client_id.clone(),
            clean_session: broker.clean_session,
            credentials,
            keep_alive: broker.keep_alive(),
            connect_timeout: broker.connect_timeout(),
            channel_capacity: broker.channel_capacity,
        })
    }

    /// `host:port` for logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A message received from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic it was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
}

/// Opens broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect and complete the handshake.
    async fn connect(&self, options: &BrokerOptions) -> Result<BrokerSession, BrokerError>;
}

/// Outbound half of a connection. Cheap to share between tasks.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), BrokerError>;
    /// Publish a payload at QoS 0 without retain.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;
    /// Queue a publish without waiting. Fails when the outbound queue is
    /// full or the connection is gone. Safe to call under a lock.
    fn try_publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;
}

/// Inbound half of a connection, owned by one receive loop.
#[async_trait]
pub trait BrokerInbox: Send {
    /// Wait for the next message. `Ok(None)` means the broker closed the
    /// connection gracefully.
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, BrokerError>;
}

/// An established connection.
pub struct BrokerSession {
    /// Publishing half.
    pub link: Arc<dyn BrokerLink>,
    /// Receiving half.
    pub inbox: Box<dyn BrokerInbox>,
}

impl fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSession").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_from_default_settings() {
        let opts = BrokerOptions::from_settings(&BurrowSettings::default()).unwrap();
        assert_eq!(opts.host, "localhost");
        assert_eq!(opts.port, 1883);
        assert_eq!(opts.client_id, "tunnel");
        assert!(opts.clean_session);
        let creds = opts.credentials.unwrap();
        assert_eq!(creds.username, "guest");
        assert_eq!(creds.password, "guest");
    }

    #[test]
    fn empty_username_means_anonymous() {
        let mut settings = BurrowSettings::default();
        settings.broker.username.clear();
        let opts = BrokerOptions::from_settings(&settings).unwrap();
        assert!(opts.credentials.is_none());
    }

    #[test]
    fn bad_address_rejected() {
        let mut settings = BurrowSettings::default();
        settings.broker.address = "no-port".into();
        assert!(BrokerOptions::from_settings(&settings).is_err());
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let creds = Credentials {
            username: "u".into(),
            password: "secret".into(),
        };
        let out = format!("{creds:?}");
        assert!(!out.contains("secret"));
        assert!(out.contains("redacted"));
    }

    #[test]
    fn error_codes() {
        assert_eq!(BrokerError::Connect("refused".into()).code(), "CONNECT_FAILED");
        assert_eq!(BrokerError::Connection("eof".into()).code(), "CONNECTION_ERROR");
    }
}

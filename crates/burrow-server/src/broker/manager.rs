//! Broker connection lifecycle.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──(read error / close)──┐
//!      ▲               │                                            │
//!      └──── backoff ◄─┴────────────────────────────────────────────┘
//! ```
//!
//! On reaching Connected the manager subscribes to the upstream filter and
//! attaches the link to the [`CorrelationRegistry`]; from then on the
//! receive loop hands every inbound message to the registry. A message the
//! registry rejects is logged and dropped. A connection-level error detaches
//! the link and restarts the cycle after the backoff delay.

use std::sync::Arc;

use burrow_core::backoff::ReconnectPolicy;
use burrow_core::topic::UPSTREAM_FILTER;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BrokerConnector, BrokerError, BrokerInbox, BrokerOptions, QoS};
use crate::metrics::{
    BROKER_CONNECT_FAILURES_TOTAL, BROKER_CONNECTED, BROKER_CONNECTS_TOTAL,
    BROKER_DISCONNECTS_TOTAL, TUNNEL_DISCARDED_TOTAL,
};
use crate::tunnel::registry::CorrelationRegistry;

/// Where the manager is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; waiting out the backoff delay.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Subscribed and receiving.
    Connected,
}

/// Why a receive loop ended.
enum Ended {
    Cancelled,
    Closed,
    Failed(BrokerError),
}

/// Owns the single broker connection.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    options: BrokerOptions,
    fresh_client_id: bool,
    policy: ReconnectPolicy,
    registry: Arc<CorrelationRegistry>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until [`run`](Self::run).
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        options: BrokerOptions,
        policy: ReconnectPolicy,
        registry: Arc<CorrelationRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            options,
            fresh_client_id: false,
            policy,
            registry,
            state,
        }
    }

    /// Suffix the client id with a unique value on every attempt.
    #[must_use]
    pub fn with_fresh_client_id(mut self, fresh: bool) -> Self {
        self.fresh_client_id = fresh;
        self
    }

    /// Subscribe to lifecycle changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let _ = self.state.send_replace(next);
        let connected = if next == ConnectionState::Connected { 1.0 } else { 0.0 };
        metrics::gauge!(BROKER_CONNECTED).set(connected);
    }

    fn attempt_options(&self) -> BrokerOptions {
        let mut options = self.options.clone();
        if self.fresh_client_id {
            options.client_id = format!(
                "{}-{}",
                self.options.client_id,
                uuid::Uuid::now_v7().simple()
            );
        }
        options
    }

    /// Connect, receive, and reconnect until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            let options = self.attempt_options();
            info!(
                address = %options.address(),
                client_id = %options.client_id,
                username = options.credentials.as_ref().map_or("", |c| c.username.as_str()),
                "connecting to broker"
            );

            let established = tokio::select! {
                () = cancel.cancelled() => break,
                result = self.establish(&options) => result,
            };

            match established {
                Ok(inbox) => {
                    attempt = 0;
                    metrics::counter!(BROKER_CONNECTS_TOTAL).increment(1);
                    self.set_state(ConnectionState::Connected);
                    info!(client_id = %options.client_id, "tunnel ready");

                    let ended = self.receive(inbox, &cancel).await;
                    let _ = self.registry.detach();
                    self.set_state(ConnectionState::Disconnected);
                    match ended {
                        Ended::Cancelled => break,
                        Ended::Closed => {
                            metrics::counter!(BROKER_DISCONNECTS_TOTAL).increment(1);
                            warn!("disconnected by broker");
                        }
                        Ended::Failed(e) => {
                            metrics::counter!(BROKER_DISCONNECTS_TOTAL).increment(1);
                            warn!(error = %e, "broker connection lost");
                        }
                    }
                }
                Err(e) => {
                    metrics::counter!(BROKER_CONNECT_FAILURES_TOTAL).increment(1);
                    self.set_state(ConnectionState::Disconnected);
                    warn!(error = %e, code = e.code(), "broker connect failed");
                }
            }

            let delay = self.policy.next_delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(?delay, attempt, "waiting before reconnect");
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        let _ = self.registry.detach();
        self.set_state(ConnectionState::Disconnected);
        info!("broker connection manager stopped");
    }

    async fn establish(&self, options: &BrokerOptions) -> Result<Box<dyn BrokerInbox>, BrokerError> {
        let session = self.connector.connect(options).await?;
        session
            .link
            .subscribe(UPSTREAM_FILTER, QoS::AtMostOnce)
            .await?;
        self.registry.attach(session.link);
        Ok(session.inbox)
    }

    async fn receive(&self, mut inbox: Box<dyn BrokerInbox>, cancel: &CancellationToken) -> Ended {
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Ended::Cancelled,
                next = inbox.next_message() => next,
            };
            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => return Ended::Closed,
                Err(e) => return Ended::Failed(e),
            };
            debug!(topic = %message.topic, size = message.payload.len(), "upstream message");
            if let Err(e) = self.registry.dispatch(&message.topic, message.payload) {
                metrics::counter!(TUNNEL_DISCARDED_TOTAL, "reason" => e.code()).increment(1);
                if e.is_discard() {
                    warn!(topic = %message.topic, error = %e, "discarding upstream message");
                } else {
                    error!(topic = %message.topic, error = %e, "failed to dispatch upstream message");
                }
            }
        }
    }
}

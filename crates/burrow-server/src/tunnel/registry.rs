//! Correlation registry.
//!
//! Owns the reference counter, the pending-request table, and the shared
//! broker link. All three live under one lock so that "is the broker
//! connected?" and "register a pending request" are a single atomic step.
//! Requests are queued on the link with a non-blocking publish inside that
//! same step, so publish order follows reference order. The lock is never
//! held across an `.await`.
//!
//! Each pending entry is removed exactly once, either by [`resolve`]
//! (response arrived) or by [`cancel`] (deadline passed). Whichever wins
//! the lock first decides the outcome.
//!
//! [`resolve`]: CorrelationRegistry::resolve
//! [`cancel`]: CorrelationRegistry::cancel

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use burrow_core::frame::{self, RequestFrame, ResponseFrame};
use burrow_core::topic;
use burrow_core::{Reference, TunnelError};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::broker::BrokerLink;
use crate::metrics::TUNNEL_PENDING_REQUESTS;

#[derive(Default)]
struct RegistryState {
    last: Option<Reference>,
    pending: HashMap<Reference, oneshot::Sender<ResponseFrame>>,
    link: Option<Arc<dyn BrokerLink>>,
}

impl RegistryState {
    /// Next reference after the last one issued that is not still pending.
    ///
    /// Terminates while fewer than `Reference::MAX` requests are pending.
    fn allocate(&mut self) -> Reference {
        let mut candidate = self.last.map_or(Reference::FIRST, Reference::next);
        while self.pending.contains_key(&candidate) {
            candidate = candidate.next();
        }
        self.last = Some(candidate);
        candidate
    }

    #[allow(clippy::cast_precision_loss)]
    fn report_pending(&self) {
        metrics::gauge!(TUNNEL_PENDING_REQUESTS).set(self.pending.len() as f64);
    }
}

/// A registered pending request.
pub struct Registration {
    /// Reference the device must echo in its response topic.
    pub reference: Reference,
    /// Link to publish the request on.
    pub link: Arc<dyn BrokerLink>,
    /// Resolves when the matching response is dispatched.
    pub response: oneshot::Receiver<ResponseFrame>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

/// Matches asynchronous device responses to waiting requests.
#[derive(Default)]
pub struct CorrelationRegistry {
    state: Mutex<RegistryState>,
}

impl CorrelationRegistry {
    /// Create an empty, disconnected registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a live broker link. Replaces any previous link.
    pub fn attach(&self, link: Arc<dyn BrokerLink>) {
        self.state.lock().link = Some(link);
    }

    /// Clear the broker link. Returns whether one was attached.
    ///
    /// Pending requests are left alone; they time out on their own.
    pub fn detach(&self) -> bool {
        self.state.lock().link.take().is_some()
    }

    /// Whether a broker link is attached.
    pub fn is_connected(&self) -> bool {
        self.state.lock().link.is_some()
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Allocate a reference and register a pending entry for it.
    ///
    /// Fails with [`TunnelError::BrokerDisconnected`] without allocating
    /// or registering anything when no link is attached.
    pub fn register(&self) -> Result<Registration, TunnelError> {
        let mut state = self.state.lock();
        let link = state
            .link
            .clone()
            .ok_or(TunnelError::BrokerDisconnected)?;
        let reference = state.allocate();
        let (tx, rx) = oneshot::channel();
        let _ = state.pending.insert(reference, tx);
        state.report_pending();
        Ok(Registration {
            reference,
            link,
            response: rx,
        })
    }

    /// Allocate a reference, queue `payload` on the downstream topic for
    /// `device_id`, and register the pending entry, as one atomic step.
    ///
    /// Nothing stays registered when the publish cannot be queued.
    pub fn send(&self, device_id: &str, payload: Bytes) -> Result<Registration, TunnelError> {
        let size = payload.len();
        let (registration, topic) = {
            let mut state = self.state.lock();
            let link = state
                .link
                .clone()
                .ok_or(TunnelError::BrokerDisconnected)?;
            let reference = state.allocate();
            let topic = topic::downstream_topic(device_id, reference);
            link.try_publish(&topic, payload)
                .map_err(|e| TunnelError::ConnectionLost(e.to_string()))?;
            let (tx, rx) = oneshot::channel();
            let _ = state.pending.insert(reference, tx);
            state.report_pending();
            let registration = Registration {
                reference,
                link,
                response: rx,
            };
            (registration, topic)
        };
        debug!(%topic, size, "published request");
        Ok(registration)
    }

    /// Deliver a response to the request registered under `reference`.
    pub fn resolve(&self, reference: Reference, response: ResponseFrame) -> Result<(), TunnelError> {
        let sender = {
            let mut state = self.state.lock();
            let sender = state.pending.remove(&reference);
            state.report_pending();
            sender
        };
        let sender = sender.ok_or(TunnelError::UnknownReference(reference))?;
        // The waiter may have given up between our removal and this send;
        // the response is dropped in that case.
        let _ = sender.send(response);
        Ok(())
    }

    /// Remove the pending entry for `reference`. Returns `false` if it was
    /// already resolved or cancelled.
    pub fn cancel(&self, reference: Reference) -> bool {
        let mut state = self.state.lock();
        let removed = state.pending.remove(&reference).is_some();
        state.report_pending();
        removed
    }

    /// Receive path for one inbound broker message: parse the topic, decode
    /// the response frame, and resolve the matching pending request.
    pub fn dispatch(&self, topic: &str, payload: Bytes) -> Result<Reference, TunnelError> {
        let route = topic::parse_upstream(topic)?;
        let response = frame::decode_response(payload)?;
        self.resolve(route.reference, response)?;
        Ok(route.reference)
    }

    /// Publish `request` to `device_id` and wait up to `deadline` for the
    /// matching response.
    pub async fn round_trip(
        &self,
        device_id: &str,
        request: &RequestFrame,
        deadline: Duration,
    ) -> Result<ResponseFrame, TunnelError> {
        let payload = frame::encode_request(request)?;
        let Registration {
            reference,
            mut response,
            ..
        } = self.send(device_id, payload)?;

        match tokio::time::timeout(deadline, &mut response).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(TunnelError::ConnectionLost(
                "pending request dropped".to_string(),
            )),
            Err(_) => {
                if self.cancel(reference) {
                    return Err(TunnelError::Timeout(deadline));
                }
                // resolve() removed the entry first; its send has completed
                // or is about to.
                response
                    .await
                    .map_err(|_| TunnelError::Timeout(deadline))
            }
        }
    }
}

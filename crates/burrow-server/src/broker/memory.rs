//! In-process broker.
//!
//! Routes publishes to every connection with a matching subscription using
//! the same `+`/`#` filter rules as MQTT. Delivery is QoS 0: messages for a
//! connection whose inbox was dropped are lost silently. A publisher
//! subscribed to its own topic receives its own message.
//!
//! Connections opened through [`BrokerConnector`] are tunnel-side; those
//! from [`MemoryBroker::connect_device`] play the device role. Only
//! tunnel-side connections are affected by [`MemoryBroker::disconnect_tunnels`]
//! and [`MemoryBroker::set_refuse_connections`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use burrow_core::topic::topic_matches;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    BrokerConnector, BrokerError, BrokerInbox, BrokerLink, BrokerOptions, BrokerSession,
    InboundMessage, QoS,
};

enum Delivery {
    Message(InboundMessage),
    Close,
    Fail(String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Tunnel,
    Device,
}

struct Connection {
    role: Role,
    client_id: String,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Hub {
    connections: HashMap<u64, Connection>,
    next_id: u64,
    refuse: bool,
    connect_attempts: u64,
}

/// In-process pub/sub broker. Clones share the same hub.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make tunnel-side connection attempts fail until reset.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.hub.lock().refuse = refuse;
    }

    /// Close every tunnel-side connection as if the broker hung up.
    pub fn disconnect_tunnels(&self) {
        self.drop_tunnels(|| Delivery::Close);
    }

    /// Fail every tunnel-side connection with a read error.
    pub fn fail_tunnels(&self, reason: &str) {
        self.drop_tunnels(|| Delivery::Fail(reason.to_string()));
    }

    fn drop_tunnels(&self, delivery: impl Fn() -> Delivery) {
        let mut hub = self.hub.lock();
        hub.connections.retain(|_, conn| {
            if conn.role == Role::Tunnel {
                let _ = conn.tx.send(delivery());
                false
            } else {
                true
            }
        });
    }

    /// Number of live tunnel-side connections.
    pub fn tunnel_connections(&self) -> usize {
        self.hub
            .lock()
            .connections
            .values()
            .filter(|c| c.role == Role::Tunnel)
            .count()
    }

    /// Client ids used by live tunnel-side connections.
    pub fn tunnel_client_ids(&self) -> Vec<String> {
        self.hub
            .lock()
            .connections
            .values()
            .filter(|c| c.role == Role::Tunnel)
            .map(|c| c.client_id.clone())
            .collect()
    }

    /// Total tunnel-side connection attempts, including refused ones.
    pub fn connect_attempts(&self) -> u64 {
        self.hub.lock().connect_attempts
    }

    /// Whether any live tunnel-side connection subscribes to `filter`.
    pub fn tunnel_subscribed(&self, filter: &str) -> bool {
        self.hub
            .lock()
            .connections
            .values()
            .any(|c| c.role == Role::Tunnel && c.filters.iter().any(|f| f == filter))
    }

    /// Open a device-side connection.
    pub fn connect_device(&self, client_id: &str) -> BrokerSession {
        self.open(Role::Device, client_id)
    }

    fn open(&self, role: Role, client_id: &str) -> BrokerSession {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut hub = self.hub.lock();
            let id = hub.next_id;
            hub.next_id += 1;
            let _ = hub.connections.insert(
                id,
                Connection {
                    role,
                    client_id: client_id.to_string(),
                    filters: Vec::new(),
                    tx,
                },
            );
            id
        };
        BrokerSession {
            link: Arc::new(MemoryLink {
                hub: Arc::clone(&self.hub),
                id,
            }),
            inbox: Box::new(MemoryInbox { rx }),
        }
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, options: &BrokerOptions) -> Result<BrokerSession, BrokerError> {
        {
            let mut hub = self.hub.lock();
            hub.connect_attempts += 1;
            if hub.refuse {
                return Err(BrokerError::Connect("connection refused".to_string()));
            }
        }
        Ok(self.open(Role::Tunnel, &options.client_id))
    }
}

/// Publishing half of an in-process connection.
pub struct MemoryLink {
    hub: Arc<Mutex<Hub>>,
    id: u64,
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), BrokerError> {
        let mut hub = self.hub.lock();
        let conn = hub
            .connections
            .get_mut(&self.id)
            .ok_or_else(|| BrokerError::Subscribe("connection closed".to_string()))?;
        if !conn.filters.iter().any(|f| f == filter) {
            conn.filters.push(filter.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.try_publish(topic, payload)
    }

    fn try_publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let hub = self.hub.lock();
        if !hub.connections.contains_key(&self.id) {
            return Err(BrokerError::Publish("connection closed".to_string()));
        }
        for conn in hub.connections.values() {
            if conn.filters.iter().any(|f| topic_matches(f, topic)) {
                let _ = conn.tx.send(Delivery::Message(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                }));
            }
        }
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        let _ = self.hub.lock().connections.remove(&self.id);
    }
}

/// Receiving half of an in-process connection.
pub struct MemoryInbox {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl BrokerInbox for MemoryInbox {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        match self.rx.recv().await {
            Some(Delivery::Message(msg)) => Ok(Some(msg)),
            Some(Delivery::Close) | None => Ok(None),
            Some(Delivery::Fail(reason)) => Err(BrokerError::Connection(reason)),
        }
    }
}

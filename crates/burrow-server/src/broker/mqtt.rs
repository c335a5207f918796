//! MQTT adapter over `rumqttc`.
//!
//! `rumqttc` splits a connection into an [`AsyncClient`] that queues
//! requests and an [`EventLoop`] that performs all network I/O. Queued
//! publishes only reach the wire while the event loop is polled, which the
//! receive loop does continuously through [`MqttInbox`].
//!
//! The event loop's own reconnect is not used: any error ends the session
//! and the connection manager starts over with a new client.

use std::sync::Arc;

use async_trait::async_trait;
use burrow_core::frame::{LENGTH_PREFIX, MAX_FIELD_LEN};
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use tracing::debug;

use super::{
    BrokerConnector, BrokerError, BrokerInbox, BrokerLink, BrokerOptions, BrokerSession,
    InboundMessage, QoS,
};

/// Connects to an MQTT 3.1.1 broker.
#[derive(Clone, Copy, Debug, Default)]
pub struct MqttConnector;

impl MqttConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

/// Room for the topic and the MQTT fixed and variable headers.
const HEADER_ALLOWANCE: usize = 64 * 1024;

/// Packet size limit in both directions: a frame with every field at its
/// maximum length, plus headers. `rumqttc` defaults to 10 KiB.
pub const MAX_PACKET_SIZE: usize = 4 * (LENGTH_PREFIX + MAX_FIELD_LEN) + HEADER_ALLOWANCE;

fn mqtt_options(options: &BrokerOptions) -> MqttOptions {
    let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
    let _ = mqtt
        .set_clean_session(options.clean_session)
        .set_keep_alive(options.keep_alive)
        .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    if let Some(creds) = &options.credentials {
        let _ = mqtt.set_credentials(&creds.username, &creds.password);
    }
    mqtt
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, options: &BrokerOptions) -> Result<BrokerSession, BrokerError> {
        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(options), options.channel_capacity.max(1));

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        debug!(code = ?ack.code, "received CONNACK");
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => return Err(BrokerError::Connect(e.to_string())),
                }
            }
        };
        tokio::time::timeout(options.connect_timeout, handshake)
            .await
            .map_err(|_| {
                BrokerError::Connect(format!(
                    "no CONNACK within {:?}",
                    options.connect_timeout
                ))
            })??;

        Ok(BrokerSession {
            link: Arc::new(MqttLink { client }),
            inbox: Box::new(MqttInbox { eventloop }),
        })
    }
}

/// Publishing half of an MQTT connection.
pub struct MqttLink {
    client: AsyncClient,
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), BrokerError> {
        self.client
            .subscribe(filter, to_rumqttc(qos))
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .publish_bytes(topic, rumqttc::QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    fn try_publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .try_publish(topic, rumqttc::QoS::AtMostOnce, false, Vec::from(payload))
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }
}

/// Receiving half of an MQTT connection.
pub struct MqttInbox {
    eventloop: EventLoop,
}

#[async_trait]
impl BrokerInbox for MqttInbox {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    }));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => return Ok(None),
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(pkid = ack.pkid, codes = ?ack.return_codes, "received SUBACK");
                }
                Ok(_) => {}
                Err(e) => return Err(BrokerError::Connection(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use burrow_core::frame::{self, RequestFrame};
    use burrow_core::{Reference, topic};
    use rumqttc::{Publish, Request};

    use super::*;
    use crate::broker::Credentials;

    fn options() -> BrokerOptions {
        BrokerOptions {
            host: "127.0.0.1".into(),
            port: 1,
            client_id: "tunnel-test".into(),
            clean_session: true,
            credentials: Some(Credentials {
                username: "guest".into(),
                password: "guest".into(),
            }),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(500),
            channel_capacity: 8,
        }
    }

    #[test]
    fn options_carry_identity_and_session_flags() {
        let mqtt = mqtt_options(&options());
        assert_eq!(mqtt.client_id(), "tunnel-test");
        assert!(mqtt.clean_session());
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(30));
        assert_eq!(mqtt.broker_address(), ("127.0.0.1".to_string(), 1));
    }

    #[test]
    fn packet_limit_admits_frames_over_ten_kib() {
        let mqtt = mqtt_options(&options());
        assert_eq!(mqtt.max_packet_size(), MAX_PACKET_SIZE);

        let request = RequestFrame {
            method: "POST".into(),
            uri: "/upload".into(),
            body: Bytes::from(vec![0x42; 16 * 1024]),
            ..RequestFrame::default()
        };
        let payload = frame::encode_request(&request).unwrap();
        let topic = topic::downstream_topic("dev1", Reference::FIRST);
        let (_client, mut eventloop) = AsyncClient::new(mqtt, 8);
        let publish = Publish::from_bytes(topic, rumqttc::QoS::AtMostOnce, payload);
        assert!(
            eventloop
                .state
                .handle_outgoing_packet(Request::Publish(publish))
                .is_ok()
        );
    }

    #[test]
    fn qos_maps_onto_rumqttc() {
        assert_eq!(to_rumqttc(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(to_rumqttc(QoS::AtLeastOnce), rumqttc::QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn unreachable_broker_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut opts = options();
        opts.port = port;
        let err = MqttConnector::new().connect(&opts).await.unwrap_err();
        assert_eq!(err.code(), "CONNECT_FAILED");
    }
}

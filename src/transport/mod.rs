//! Broker transport abstraction
//!
//! The engine never talks to a socket directly. It drives a [`BrokerTransport`],
//! which owns the physical connection, invokes a [`MessageHandler`] for every
//! incoming publish, and reports lifecycle changes to a [`ConnectionObserver`].
//! [`mqtt::MqttTransport`] is the `rumqttc` implementation; tests use
//! [`crate::testing::MockBroker`].

use crate::envelope::Committer;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

pub use mqtt::ConnectionState;
pub use rumqttc::v5::mqttbytes::QoS;

/// Raw delivery as handed over by the broker I/O layer
#[derive(Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub duplicate: bool,
    /// Broker-assigned packet id (0 for QoS 0)
    pub packet_id: u16,
    pub committer: Option<Arc<dyn Committer>>,
}

impl RawMessage {
    /// Plain QoS 0 delivery without acknowledgement capability
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            duplicate: false,
            packet_id: 0,
            committer: None,
        }
    }
}

impl std::fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMessage")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .field("packet_id", &self.packet_id)
            .field("manual_ack", &self.committer.is_some())
            .finish()
    }
}

/// Broker-facing callback, invoked on the transport's I/O task.
/// Implementations must not block.
pub type MessageHandler = Arc<dyn Fn(RawMessage) + Send + Sync>;

/// Lifecycle hooks installed on a transport before it first connects
pub trait ConnectionObserver: Send + Sync {
    /// ConnAck received, on the first connect and after every reconnect
    fn on_connected(&self);

    fn on_connection_lost(&self, reason: &str);

    fn on_reconnecting(&self, attempt: u32);
}

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Request could not be queued")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Broker rejected request: {0}")]
    Rejected(String),
    #[error("Acknowledgement channel closed before broker replied")]
    AckDropped,
    #[error("No broker reply within {} ms", .0.as_millis())]
    Timeout(Duration),
}

/// Operations the engine consumes from a broker connection
///
/// All methods take `&self`; implementations are shared behind an `Arc`
/// between the client, the reconnection coordinator and spawned tasks.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Establish the connection, returning once the broker acknowledged it
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection, giving in-flight work up to `wait` to finish
    async fn disconnect(&self, wait: Duration) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    fn connection_state(&self) -> ConnectionState;

    /// Install lifecycle hooks. Must be called before `connect`.
    fn set_observer(&self, observer: Arc<dyn ConnectionObserver>);

    /// Subscribe and route matching publishes to `handler`; resolves on SubAck
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), TransportError>;

    /// Unsubscribe and drop the route; resolves on UnsubAck
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Host name reported by health checks
    fn broker_host(&self) -> String;
}

/// Convert the protocol QoS to its wire number
pub fn qos_number(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

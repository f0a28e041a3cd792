//! Pub/sub transport abstraction.
//!
//! The bridge talks to the broker only through [`Transport`]. A session is
//! opened with [`Transport::connect`], which hands back the stream of inbound
//! events for that session. The stream ends with a
//! [`TransportEvent::ConnectionLost`] (or simply closes) when the session drops.

pub mod memory;
pub mod mqtt;

pub use memory::{MemoryTransport, PublishedMessage};
pub use mqtt::MqttTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Event delivered on a session's inbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The session dropped; no further events follow
    ConnectionLost(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// No session is open
    #[error("Session closed")]
    Closed,

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Client side of a broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session and return its inbound event stream.
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Subscribe the open session to a topic filter.
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Publish with at-least-once delivery.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Close the session.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

//! Publish/subscribe transport seam.
//!
//! The job processor talks to the job queue only through
//! [`JobsTransport`]: it subscribes to topic filters and publishes
//! request payloads. Inbound messages are not pulled through the trait;
//! each implementation hands out an `mpsc::Receiver<InboundMessage>` when
//! it is constructed, and the processor's dispatch loop drains it.
//!
//! - [`mqtt::MqttTransport`]: AWS IoT over MQTT/TLS with reconnect.
//! - [`memory::MemoryTransport`]: in-process loopback for tests.

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;

pub use memory::MemoryTransport;
pub use mqtt::MqttTransport;

/// Capacity of the inbound message channel handed out by transports.
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
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

/// Minimal publish/subscribe contract the job processor depends on.
///
/// Connection management (connect, reconnect, disconnect) belongs to the
/// implementation, not to callers.
#[async_trait]
pub trait JobsTransport: Send + Sync {
    /// Subscribe to a topic filter. `+` and `#` wildcards are supported.
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Publish `payload` to `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Errors surfaced by a [`JobsTransport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The client could not queue the request (event loop gone or full).
    #[error("Client error: {0}")]
    Client(String),

    /// TLS material could not be loaded.
    #[error("Failed to read {path}: {source}")]
    Credentials {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,
}

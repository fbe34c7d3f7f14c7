//! In-process loopback transport.
//!
//! [`MemoryTransport`] records every subscription and publish and lets a
//! caller inject inbound messages, which are delivered only when a
//! recorded filter matches, as a broker would. It backs the processor
//! tests and local dry runs without a broker.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use autonom_core::topics::topic_matches;
use tokio::sync::{mpsc, Notify};

use super::{InboundMessage, JobsTransport, TransportError, INBOUND_CHANNEL_CAPACITY};

/// A payload published through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// Payload decoded as JSON, or `Value::Null` if it is not JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Loopback [`JobsTransport`].
pub struct MemoryTransport {
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    published_notify: Notify,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl MemoryTransport {
    /// Create a transport and the receiver its deliveries arrive on.
    pub fn new() -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let transport = Self {
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            published_notify: Notify::new(),
            inbound_tx,
        };
        (transport, inbound_rx)
    }

    /// Filters subscribed so far, in subscription order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Everything published so far, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages published to exactly `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Deliver a message as if the broker had routed it to this client.
    ///
    /// Returns `false` (and drops the message) when no subscription
    /// matches `topic`.
    pub async fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let subscribed = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|filter| topic_matches(filter, topic));

        if !subscribed {
            tracing::debug!(topic, "No subscription matches, dropping message");
            return false;
        }

        self.inbound_tx
            .send(InboundMessage::new(topic, payload))
            .await
            .is_ok()
    }

    /// Deliver a JSON payload. See [`deliver`](Self::deliver).
    pub async fn deliver_json(&self, topic: &str, payload: &serde_json::Value) -> bool {
        self.deliver(topic, payload.to_string()).await
    }

    /// Wait until at least `count` messages have been published, or until
    /// `timeout` elapses. Returns everything published so far either way.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<PublishedMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.published_notify.notified();
            let published = self.published();
            if published.len() >= count {
                return published;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.published();
            }
        }
    }
}

#[async_trait]
impl JobsTransport for MemoryTransport {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !subs.iter().any(|s| s == filter) {
            subs.push(filter.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.inbound_tx.is_closed() {
            return Err(TransportError::Closed);
        }
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload,
            });
        self.published_notify.notify_waiters();
        Ok(())
    }
}

//! Outbound request worker.
//!
//! Start-next and update requests are handed to a [`Publisher`] handle,
//! which queues them on a bounded channel without waiting. A single
//! background task drains the queue and publishes through the transport
//! with a per-request timeout, so a slow broker never stalls the inbound
//! dispatch loop and requests go out in the order they were made.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transport::JobsTransport;

/// Default capacity of the outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Tuning for the publish worker.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub queue_capacity: usize,
    /// Upper bound on a single `JobsTransport::publish` call.
    pub publish_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// A request waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Cheap, cloneable handle for queueing outbound requests.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::Sender<OutboundRequest>,
}

impl Publisher {
    /// Spawn the publish worker.
    ///
    /// The worker exits when `cancel` fires or every handle is dropped.
    pub fn spawn(
        transport: Arc<dyn JobsTransport>,
        config: PublisherConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let handle = tokio::spawn(run_worker(transport, rx, config.publish_timeout, cancel));
        (Self { tx }, handle)
    }

    /// Queue a request without waiting.
    ///
    /// Fails when the queue is full or the worker has stopped; the request
    /// is dropped in that case.
    pub fn enqueue(&self, request: OutboundRequest) -> Result<(), PublishError> {
        self.tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(r) => PublishError::QueueFull(r.topic),
            TrySendError::Closed(r) => PublishError::Stopped(r.topic),
        })
    }
}

/// Errors returned by [`Publisher::enqueue`].
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Outbound queue full, dropped request for {0}")]
    QueueFull(String),

    #[error("Publisher stopped, dropped request for {0}")]
    Stopped(String),
}

async fn run_worker(
    transport: Arc<dyn JobsTransport>,
    mut rx: mpsc::Receiver<OutboundRequest>,
    publish_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let topic = request.topic;
        match tokio::time::timeout(publish_timeout, transport.publish(&topic, request.payload))
            .await
        {
            Ok(Ok(())) => tracing::debug!(topic = %topic, "Published request"),
            Ok(Err(e)) => tracing::error!(topic = %topic, error = %e, "Publish failed"),
            Err(_) => tracing::error!(
                topic = %topic,
                timeout_ms = publish_timeout.as_millis() as u64,
                "Publish timed out",
            ),
        }
    }

    tracing::debug!("Publish worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, TransportError};
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    fn request(topic: &str) -> OutboundRequest {
        OutboundRequest {
            topic: topic.to_string(),
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn publishes_in_order() {
        let (transport, _rx) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let cancel = CancellationToken::new();
        let (publisher, _handle) =
            Publisher::spawn(transport.clone(), PublisherConfig::default(), cancel.clone());

        for topic in ["first", "second", "third"] {
            publisher.enqueue(request(topic)).unwrap();
        }

        let published = transport
            .wait_for_published(3, Duration::from_secs(5))
            .await;
        let topics: Vec<_> = published.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, ["first", "second", "third"]);
        cancel.cancel();
    }

    /// Transport whose publish never completes.
    struct StuckTransport;

    #[async_trait]
    impl JobsTransport for StuckTransport {
        async fn subscribe(&self, _filter: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn enqueue_never_waits_on_a_stuck_transport() {
        let cancel = CancellationToken::new();
        let config = PublisherConfig {
            queue_capacity: 1,
            publish_timeout: Duration::from_secs(3600),
        };
        let (publisher, _handle) = Publisher::spawn(Arc::new(StuckTransport), config, cancel.clone());

        // The worker takes the first request and hangs on it; the second
        // fills the queue and the third overflows.
        publisher.enqueue(request("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.enqueue(request("b")).unwrap();
        assert_matches!(publisher.enqueue(request("c")), Err(PublishError::QueueFull(t)) if t == "c");
        cancel.cancel();
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails() {
        let (transport, _rx) = MemoryTransport::new();
        let cancel = CancellationToken::new();
        let (publisher, handle) =
            Publisher::spawn(Arc::new(transport), PublisherConfig::default(), cancel.clone());

        cancel.cancel();
        handle.await.unwrap();

        assert_matches!(publisher.enqueue(request("late")), Err(PublishError::Stopped(_)));
    }
}

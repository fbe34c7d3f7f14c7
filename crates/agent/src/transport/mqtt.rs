//! AWS IoT MQTT transport.
//!
//! [`MqttTransport`] wraps a `rumqttc` client connected over TLS with
//! the thing's X.509 certificate. A background task drives the MQTT
//! event loop: it forwards inbound publishes to the processor, and on
//! connection errors it backs off and polls again (which reconnects).
//! When the broker comes back without a session, every recorded
//! subscription is re-issued.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
    Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::reconnect::{Backoff, BackoffPolicy};

use super::{InboundMessage, JobsTransport, TransportError, INBOUND_CHANNEL_CAPACITY};

/// MQTT keep-alive interval.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Upper bound on flushing the DISCONNECT packet at shutdown.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the rumqttc request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Connection parameters for [`MqttTransport`].
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub reconnect: BackoffPolicy,
}

impl MqttSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            host: config.host_name.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            ca_path: config.ca_path.clone(),
            cert_path: config.cert_path.clone(),
            key_path: config.key_path.clone(),
            reconnect: BackoffPolicy::default(),
        }
    }
}

/// [`JobsTransport`] backed by an MQTT/TLS connection.
pub struct MqttTransport {
    client: AsyncClient,
    /// Filters subscribed so far, replayed after a session-less reconnect.
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl MqttTransport {
    /// Load the TLS material, create the client, and spawn the event loop.
    ///
    /// The connection itself is established by the event loop task, so
    /// this returns as soon as the credentials are read. Subscriptions and
    /// publishes issued before the first `CONNACK` are queued.
    pub async fn start(
        settings: MqttSettings,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>, JoinHandle<()>), TransportError> {
        let ca = read_pem(&settings.ca_path).await?;
        let cert = read_pem(&settings.cert_path).await?;
        let key = read_pem(&settings.key_path).await?;

        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: Some((cert, key)),
        }));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));

        tracing::info!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            "Starting MQTT event loop",
        );

        let handle = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&subscriptions),
            inbound_tx,
            settings.reconnect,
            cancel,
        ));

        Ok((
            Self {
                client,
                subscriptions,
            },
            inbound_rx,
            handle,
        ))
    }
}

#[async_trait]
impl JobsTransport for MqttTransport {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        {
            let mut subs = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !subs.iter().any(|s| s == filter) {
                subs.push(filter.to_string());
            }
        }

        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))?;

        tracing::debug!(filter, "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| TransportError::Credentials {
            path: path.display().to_string(),
            source,
        })
}

/// Poll the MQTT event loop until cancelled or the inbound receiver is
/// dropped, then disconnect.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<String>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    reconnect: BackoffPolicy,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(reconnect);
    let mut connected_once = false;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT message");
                let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = inbound_tx.send(message) => {
                        if sent.is_err() {
                            tracing::info!("Inbound receiver dropped, stopping MQTT event loop");
                            break;
                        }
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::info!(session_present = ack.session_present, "Connected to MQTT broker");
                backoff.reset();
                if connected_once && !ack.session_present {
                    resubscribe(&client, &subscriptions);
                }
                connected_once = true;
            }
            Ok(_) => {}
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "MQTT connection error, reconnecting",
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    tracing::info!("MQTT event loop stopped");
    disconnect(&client, &mut eventloop).await;
}

/// Queue a DISCONNECT and keep polling until it has been written, the
/// connection fails, or [`DISCONNECT_TIMEOUT`] elapses.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        tracing::debug!(error = %e, "MQTT disconnect not queued");
        return;
    }

    let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    })
    .await;

    match flushed {
        Ok(Ok(())) => tracing::info!("Disconnected from MQTT broker"),
        Ok(Err(e)) => tracing::debug!(error = %e, "Connection closed before DISCONNECT was sent"),
        Err(_) => tracing::debug!("Timed out sending MQTT DISCONNECT"),
    }
}

/// Re-issue every recorded subscription without waiting on the request
/// channel, since this runs on the event loop task that drains it.
fn resubscribe(client: &AsyncClient, subscriptions: &Mutex<Vec<String>>) {
    let subs = subscriptions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    tracing::info!(count = subs.len(), "Restoring subscriptions after reconnect");
    for filter in subs {
        if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
            tracing::error!(filter = %filter, error = %e, "Failed to restore subscription");
        }
    }
}

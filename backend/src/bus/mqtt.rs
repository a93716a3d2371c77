//! MQTT transport for the Command Bus.
//!
//! The connection is created with a clean session, so nothing survives a
//! reconnect on the broker side: every ConnAck re-issues the wildcard
//! subscriptions. rumqttc reconnects on the next poll after an error; the
//! event loop only paces those attempts.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::ClientConfig;

use super::{BusStatus, InboundMessage, Publisher};

/// Configuration for MQTT connection
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub keep_alive_secs: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("irrigation-backend-{}", uuid::Uuid::new_v4()),
            username: None,
            password: None,
            use_tls: false,
            keep_alive_secs: 60,
            reconnect_delay_ms: 1000,
        }
    }
}

impl MqttConfig {
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }
}

/// Error types for MQTT operations
#[derive(Debug, Clone, Error)]
pub enum MqttError {
    #[error("MQTT connection failed: {0}")]
    ConnectionFailed(String),
    #[error("MQTT publish failed: {0}")]
    PublishFailed(String),
    #[error("MQTT client disconnected")]
    Disconnected,
}

/// Maps a numeric QoS level (0, 1, 2) to the protocol enum.
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// A managed MQTT connection feeding the inbound dispatch channel.
pub struct MqttBus {
    client: AsyncClient,
    config: MqttConfig,
    subscriptions: Vec<String>,
    connected: Arc<AtomicBool>,
    event_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Create the client and spawn its event loop. The broker connection
    /// itself is established asynchronously; until the first ConnAck the
    /// bus reports disconnected and refuses publishes.
    pub fn connect(
        config: MqttConfig,
        subscriptions: Vec<String>,
        qos: QoS,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Self, MqttError> {
        let mqtt_options = Self::build_options(&config)?;
        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let connected = Arc::new(AtomicBool::new(false));

        let event_handle = tokio::spawn(Self::run_event_loop(
            eventloop,
            client.clone(),
            subscriptions.clone(),
            qos,
            connected.clone(),
            inbound,
            Duration::from_millis(config.reconnect_delay_ms),
        ));

        info!("Connecting to MQTT broker {}", config.broker_address());

        Ok(Self {
            client,
            config,
            subscriptions,
            connected,
            event_handle: Mutex::new(Some(event_handle)),
        })
    }

    fn build_options(config: &MqttConfig) -> Result<MqttOptions, MqttError> {
        if config.broker_host.is_empty() {
            return Err(MqttError::ConnectionFailed("broker host is empty".to_string()));
        }

        let mut mqtt_options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);

        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        mqtt_options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        if config.use_tls {
            // Load native root certificates from the operating system
            let mut root_cert_store = tokio_rustls::rustls::RootCertStore::empty();

            let cert_result = rustls_native_certs::load_native_certs();

            for err in &cert_result.errors {
                warn!("Error loading native cert: {}", err);
            }

            let (added, _ignored) = root_cert_store.add_parsable_certificates(cert_result.certs);
            debug!("Loaded {} native root certificates for TLS", added);

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            mqtt_options.set_transport(Transport::tls_with_config(client_config.into()));
        }

        Ok(mqtt_options)
    }

    /// Run the MQTT event loop until the client disconnects or the dispatch
    /// side hangs up.
    async fn run_event_loop(
        mut eventloop: EventLoop,
        client: AsyncClient,
        subscriptions: Vec<String>,
        qos: QoS,
        connected: Arc<AtomicBool>,
        inbound: mpsc::Sender<InboundMessage>,
        reconnect_delay: Duration,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected.store(true, Ordering::SeqCst);
                    info!("MQTT connection acknowledged");

                    // try_subscribe: the request queue is drained by this very loop
                    for topic in &subscriptions {
                        match client.try_subscribe(topic.as_str(), qos) {
                            Ok(()) => debug!("Subscribing to {}", topic),
                            Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(
                        "MQTT received on {}: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );
                    let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                    if inbound.send(message).await.is_err() {
                        warn!("Inbound dispatch channel closed, stopping MQTT event loop");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("MQTT subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    warn!("MQTT broker closed the session");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    info!("MQTT client disconnecting");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if connected.swap(false, Ordering::SeqCst) {
                        warn!("MQTT connection lost: {}", e);
                    } else {
                        error!("MQTT event loop error: {}", e);
                    }
                    tokio::time::sleep(reconnect_delay).await;
                    debug!("MQTT reconnecting...");
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Disconnect the client
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| MqttError::ConnectionFailed(e.to_string()));
        self.connected.store(false, Ordering::SeqCst);

        if let Some(handle) = self.event_handle.lock().await.take() {
            handle.abort();
        }
        result
    }
}

#[async_trait]
impl Publisher for MqttBus {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> bool {
        if !self.is_connected() {
            error!("{}, cannot publish to {}", MqttError::Disconnected, topic);
            return false;
        }

        match self.client.publish(topic, qos, false, payload.to_vec()).await {
            Ok(()) => {
                debug!("Published {} bytes to {}", payload.len(), topic);
                true
            }
            Err(e) => {
                error!("{}", MqttError::PublishFailed(format!("{}: {}", topic, e)));
                false
            }
        }
    }

    fn status(&self) -> BusStatus {
        let connected = self.is_connected();
        BusStatus {
            connected,
            broker: self.config.broker_address(),
            client_id: self.config.client_id.clone(),
            subscribed_topics: if connected {
                self.subscriptions.clone()
            } else {
                Vec::new()
            },
        }
    }

    async fn shutdown(&self) {
        match self.disconnect().await {
            Ok(()) => info!("MQTT disconnected"),
            Err(e) => warn!("{}", e),
        }
    }
}

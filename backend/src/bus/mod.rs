//! Command Bus: publish-subscribe plumbing between the backend and the
//! field devices.
//!
//! The transport delivers inbound traffic as [`InboundMessage`] values on a
//! channel consumed by [`dispatch::Dispatcher`]; outbound traffic goes through
//! [`CommandBus`], which never fails loudly: every publish reports a plain
//! success flag and the caller decides what to do about a refusal.

use async_trait::async_trait;
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub mod dispatch;
pub mod messages;
pub mod mqtt;
pub mod topics;

pub use rumqttc::QoS;

use messages::{CommandPayload, FirmwareRelease, FirmwareUpdatePayload};

/// A message received from the transport.
#[derive(Debug, Clone)]
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

    /// Try to parse the payload as JSON
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Lossy payload text, for logs.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Snapshot of the transport connection.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BusStatus {
    pub connected: bool,
    pub broker: String,
    pub client_id: String,
    pub subscribed_topics: Vec<String>,
}

/// Outbound side of a transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns false when the message was not handed to the transport.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> bool;

    fn status(&self) -> BusStatus;

    /// Close the connection; publishing afterwards returns false.
    async fn shutdown(&self) {}
}

/// Typed outbound API used by the engine and the request handlers.
#[derive(Clone)]
pub struct CommandBus {
    publisher: Arc<dyn Publisher>,
    default_qos: QoS,
}

impl CommandBus {
    pub fn new(publisher: Arc<dyn Publisher>, default_qos: QoS) -> Self {
        Self {
            publisher,
            default_qos,
        }
    }

    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> bool {
        self.publisher.publish(topic, payload, qos).await
    }

    /// Publish JSON payload
    pub async fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> bool {
        match serde_json::to_vec(payload) {
            Ok(json) => self.publish(topic, &json, self.default_qos).await,
            Err(e) => {
                error!("Failed to serialize payload for {}: {}", topic, e);
                false
            }
        }
    }

    pub async fn send_command(&self, device_id: &str, command: &CommandPayload) -> bool {
        self.publish_json(&topics::device_command(device_id), command)
            .await
    }

    pub async fn send_config(&self, device_id: &str, config: &Value) -> bool {
        self.publish_json(&topics::device_config(device_id), config)
            .await
    }

    pub async fn send_firmware_update(&self, device_id: &str, release: &FirmwareRelease) -> bool {
        self.publish_json(
            &topics::firmware_update(device_id),
            &FirmwareUpdatePayload::start(release),
        )
        .await
    }

    pub fn status(&self) -> BusStatus {
        self.publisher.status()
    }

    pub async fn shutdown(&self) {
        self.publisher.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPublisher;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_inbound_message_parse_json() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct TestPayload {
            value: i32,
        }

        let msg = InboundMessage::new("test", br#"{"value": 42}"#.to_vec());
        let parsed: TestPayload = msg.parse_json().unwrap();
        assert_eq!(parsed.value, 42);

        let msg = InboundMessage::new("test", b"not json".to_vec());
        assert!(msg.parse_json::<TestPayload>().is_err());
        assert_eq!(msg.payload_str(), "not json");
    }

    #[tokio::test]
    async fn test_send_command_targets_device_topic() {
        let publisher = Arc::new(RecordingPublisher::new());
        let bus = CommandBus::new(publisher.clone(), QoS::AtLeastOnce);

        assert!(bus.send_command("ESP32_001", &CommandPayload::pump_off(Utc::now())).await);

        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "iot/device/ESP32_001/command");
        assert_eq!(sent[0].1["action"], "pump_off");
    }

    #[tokio::test]
    async fn test_send_config_passes_object_through() {
        let publisher = Arc::new(RecordingPublisher::new());
        let bus = CommandBus::new(publisher.clone(), QoS::AtLeastOnce);

        let config = json!({"mode": "schedule", "threshold": {"soilMoisture": 35}});
        assert!(bus.send_config("ESP32_001", &config).await);
        assert_eq!(publisher.sent()[0].1, config);
    }

    #[tokio::test]
    async fn test_publish_on_disconnected_bus_returns_false() {
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.set_connected(false);
        let bus = CommandBus::new(publisher.clone(), QoS::AtLeastOnce);

        assert!(!bus.publish("iot/device/x/command", b"{}", QoS::AtMostOnce).await);
        assert!(publisher.sent().is_empty());
    }
}

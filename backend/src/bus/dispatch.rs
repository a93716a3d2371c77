//! Inbound dispatch loop.
//!
//! One task drains the transport channel and routes each message to Sensor
//! Ingestion or the Liveness Tracker. A message that cannot be routed is
//! logged and dropped; nothing a device sends ends the loop.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::messages::{SensorPayload, StatusPayload};
use super::topics::{self, InboundKind};
use super::InboundMessage;
use crate::error::{EngineError, EngineResult};
use crate::services::ingestion::SensorIngestion;
use crate::services::liveness::LivenessTracker;

/// Longest payload excerpt written to the log for a dropped message.
const LOG_EXCERPT_CHARS: usize = 200;

/// What a successfully dispatched message did.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Reading { device: String },
    Presence { device: String, kind: InboundKind },
}

#[derive(Clone)]
pub struct Dispatcher {
    ingestion: SensorIngestion,
    liveness: LivenessTracker,
}

impl Dispatcher {
    pub fn new(ingestion: SensorIngestion, liveness: LivenessTracker) -> Self {
        Self {
            ingestion,
            liveness,
        }
    }

    /// Consume messages until every sender is gone.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>) {
        info!("Inbound dispatch loop started");
        while let Some(message) = inbound.recv().await {
            match self.dispatch(&message, Utc::now()).await {
                Ok(routed) => debug!("Dispatched {}: {:?}", message.topic, routed),
                Err(e) => {
                    let excerpt: String = message.payload_str().chars().take(LOG_EXCERPT_CHARS).collect();
                    warn!("Dropped message on {}: {} (payload: {})", message.topic, e, excerpt);
                }
            }
        }
        info!("Inbound dispatch loop stopped");
    }

    pub async fn dispatch(&self, message: &InboundMessage, now: DateTime<Utc>) -> EngineResult<Routed> {
        let (device_id, kind) = topics::classify(&message.topic).ok_or_else(|| {
            EngineError::MalformedMessage(format!("unrouted topic {}", message.topic))
        })?;

        match kind {
            InboundKind::SensorData => {
                let payload: SensorPayload = message.parse_json()?;
                self.ingestion.ingest(device_id, &payload, now).await?;
                Ok(Routed::Reading {
                    device: device_id.to_string(),
                })
            }
            InboundKind::Heartbeat => {
                self.liveness.touch(device_id, now).await?;
                Ok(Routed::Presence {
                    device: device_id.to_string(),
                    kind,
                })
            }
            InboundKind::Status => {
                let payload: StatusPayload = message.parse_json()?;
                self.liveness.touch(device_id, now).await?;
                if let Some(status) = payload.status {
                    info!("Device {} reports status '{}'", device_id, status);
                }
                Ok(Routed::Presence {
                    device: device_id.to_string(),
                    kind,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceMode, Liveness};
    use crate::testing::{device, utc, MemoryStore};
    use std::sync::Arc;

    fn dispatcher(store: &Arc<MemoryStore>) -> Dispatcher {
        let liveness = LivenessTracker::new(store.clone());
        let ingestion = SensorIngestion::new(store.clone(), store.clone(), liveness.clone());
        Dispatcher::new(ingestion, liveness)
    }

    fn store_with_device() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.add_device(device(1, "ESP32_001", DeviceMode::Schedule));
        store
    }

    #[tokio::test]
    async fn test_heartbeat_payload_is_not_inspected() {
        let store = store_with_device();
        let now = utc(2024, 1, 1, 9, 0, 0);
        let msg = InboundMessage::new(topics::device_heartbeat("ESP32_001"), b"ping".to_vec());

        let routed = dispatcher(&store).dispatch(&msg, now).await.unwrap();
        assert_eq!(
            routed,
            Routed::Presence {
                device: "ESP32_001".to_string(),
                kind: InboundKind::Heartbeat
            }
        );
        assert_eq!(store.device(1).unwrap().last_seen, Some(now));
    }

    #[tokio::test]
    async fn test_status_counts_as_presence() {
        let store = store_with_device();
        let msg = InboundMessage::new(
            topics::device_status("ESP32_001"),
            br#"{"status":"online","timestamp":12345}"#.to_vec(),
        );

        dispatcher(&store)
            .dispatch(&msg, utc(2024, 1, 1, 9, 0, 0))
            .await
            .unwrap();
        assert_eq!(store.device(1).unwrap().liveness(), Liveness::Online);
    }

    #[tokio::test]
    async fn test_sensor_data_is_ingested() {
        let store = store_with_device();
        let msg = InboundMessage::new(
            topics::sensor_data("ESP32_001"),
            br#"{"temperature":31.2,"humidity":80,"soilMoisture":22,"isRain":false}"#.to_vec(),
        );

        let routed = dispatcher(&store)
            .dispatch(&msg, utc(2024, 1, 1, 9, 0, 0))
            .await
            .unwrap();
        assert!(matches!(routed, Routed::Reading { .. }));
        assert_eq!(store.readings().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_are_errors() {
        let store = store_with_device();
        let d = dispatcher(&store);
        let now = utc(2024, 1, 1, 9, 0, 0);

        let bad_json = InboundMessage::new(topics::sensor_data("ESP32_001"), b"{oops".to_vec());
        assert!(matches!(
            d.dispatch(&bad_json, now).await,
            Err(EngineError::MalformedMessage(_))
        ));

        let unknown_device = InboundMessage::new(topics::device_heartbeat("ghost"), b"{}".to_vec());
        assert!(matches!(
            d.dispatch(&unknown_device, now).await,
            Err(EngineError::NotFound(_))
        ));

        let foreign = InboundMessage::new("iot/device/ESP32_001/command", b"{}".to_vec());
        assert!(d.dispatch(&foreign, now).await.is_err());
        assert!(store.readings().is_empty());
    }

    #[tokio::test]
    async fn test_run_survives_bad_messages() {
        let store = store_with_device();
        let (tx, rx) = mpsc::channel(8);

        tx.send(InboundMessage::new(topics::sensor_data("ESP32_001"), b"garbage".to_vec()))
            .await
            .unwrap();
        tx.send(InboundMessage::new("random/topic", b"{}".to_vec()))
            .await
            .unwrap();
        tx.send(InboundMessage::new(
            topics::sensor_data("ESP32_001"),
            br#"{"soilMoisture":"48"}"#.to_vec(),
        ))
        .await
        .unwrap();
        drop(tx);

        dispatcher(&store).run(rx).await;

        let readings = store.readings();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].soil_moisture, Some(48.0));
    }
}

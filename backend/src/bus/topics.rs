//! Topic namespace shared by the backend and the field devices.
//!
//! Every topic lives under `iot/device/{externalId}/…`. Devices publish
//! telemetry, heartbeat and status; the backend publishes command, config and
//! firmware directives.

pub const TOPIC_PREFIX: &str = "iot/device";

/// Wildcard subscriptions re-established on every (re)connect.
pub const ALL_SENSOR_DATA: &str = "iot/device/+/sensor/data";
pub const ALL_DEVICE_STATUS: &str = "iot/device/+/status";
pub const ALL_DEVICE_HEARTBEAT: &str = "iot/device/+/heartbeat";

/// Classes of inbound traffic the dispatch loop understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    SensorData,
    Heartbeat,
    Status,
}

// ===== Device -> backend =====

pub fn sensor_data(device_id: &str) -> String {
    format!("{}/{}/sensor/data", TOPIC_PREFIX, device_id)
}

pub fn device_status(device_id: &str) -> String {
    format!("{}/{}/status", TOPIC_PREFIX, device_id)
}

pub fn device_heartbeat(device_id: &str) -> String {
    format!("{}/{}/heartbeat", TOPIC_PREFIX, device_id)
}

// ===== Backend -> device =====

pub fn device_command(device_id: &str) -> String {
    format!("{}/{}/command", TOPIC_PREFIX, device_id)
}

pub fn device_config(device_id: &str) -> String {
    format!("{}/{}/config", TOPIC_PREFIX, device_id)
}

pub fn firmware_update(device_id: &str) -> String {
    format!("{}/{}/firmware/update", TOPIC_PREFIX, device_id)
}

pub fn subscription_patterns() -> Vec<String> {
    vec![
        ALL_SENSOR_DATA.to_string(),
        ALL_DEVICE_STATUS.to_string(),
        ALL_DEVICE_HEARTBEAT.to_string(),
    ]
}

/// Splits an inbound topic into the device external id and its class.
///
/// Returns `None` for anything outside the namespace or with an unknown
/// suffix, including our own outbound topics echoed back by the broker.
pub fn classify(topic: &str) -> Option<(&str, InboundKind)> {
    let rest = topic.strip_prefix(TOPIC_PREFIX)?.strip_prefix('/')?;
    let (device_id, suffix) = rest.split_once('/')?;
    if device_id.is_empty() || device_id.contains(['+', '#']) {
        return None;
    }

    let kind = match suffix {
        "sensor/data" => InboundKind::SensorData,
        "heartbeat" => InboundKind::Heartbeat,
        "status" => InboundKind::Status,
        _ => return None,
    };

    Some((device_id, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_topics() {
        assert_eq!(device_command("ESP32_001"), "iot/device/ESP32_001/command");
        assert_eq!(device_config("ESP32_001"), "iot/device/ESP32_001/config");
        assert_eq!(
            firmware_update("ESP32_001"),
            "iot/device/ESP32_001/firmware/update"
        );
    }

    #[test]
    fn test_classify_inbound_topics() {
        assert_eq!(
            classify(&sensor_data("ESP32_001")),
            Some(("ESP32_001", InboundKind::SensorData))
        );
        assert_eq!(
            classify(&device_heartbeat("garden-2")),
            Some(("garden-2", InboundKind::Heartbeat))
        );
        assert_eq!(
            classify(&device_status("garden-2")),
            Some(("garden-2", InboundKind::Status))
        );
    }

    #[test]
    fn test_classify_rejects_foreign_topics() {
        assert_eq!(classify("iot/device/ESP32_001/command"), None);
        assert_eq!(classify("iot/device/ESP32_001/firmware/update"), None);
        assert_eq!(classify("iot/device//heartbeat"), None);
        assert_eq!(classify("iot/devices/ESP32_001/heartbeat"), None);
        assert_eq!(classify("home/ESP32_001/heartbeat"), None);
        assert_eq!(classify("iot/device/ESP32_001"), None);
    }

    #[test]
    fn test_subscription_patterns_cover_every_inbound_class() {
        let patterns = subscription_patterns();
        assert_eq!(patterns.len(), 3);
        assert!(patterns.iter().all(|p| p.starts_with(TOPIC_PREFIX)));
    }
}

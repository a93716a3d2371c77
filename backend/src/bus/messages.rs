//! Payload shapes carried over the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PUMP_ON: &str = "pump_on";
pub const PUMP_OFF: &str = "pump_off";
pub const START_UPDATE: &str = "start_update";

/// Outbound `{action, timestamp}` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

impl CommandPayload {
    pub fn new(action: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            action: action.into(),
            timestamp,
        }
    }

    pub fn pump_on(timestamp: DateTime<Utc>) -> Self {
        Self::new(PUMP_ON, timestamp)
    }

    pub fn pump_off(timestamp: DateTime<Utc>) -> Self {
        Self::new(PUMP_OFF, timestamp)
    }

    /// Commanded pump state for pump actions, `None` for anything else.
    pub fn pump_state(&self) -> Option<bool> {
        match self.action.as_str() {
            PUMP_ON => Some(true),
            PUMP_OFF => Some(false),
            _ => None,
        }
    }
}

/// Firmware build offered to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareRelease {
    pub version: String,
    pub url: String,
    pub size: u64,
    pub checksum: String,
}

/// One-shot `{version, url, size, checksum, action:"start_update"}` directive.
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareUpdatePayload<'a> {
    #[serde(flatten)]
    pub release: &'a FirmwareRelease,
    pub action: &'static str,
}

impl<'a> FirmwareUpdatePayload<'a> {
    pub fn start(release: &'a FirmwareRelease) -> Self {
        Self {
            release,
            action: START_UPDATE,
        }
    }
}

/// Inbound `{temperature, humidity, soilMoisture, isRain}` telemetry.
///
/// Fields stay loosely typed: devices send numbers, numeric strings or
/// nothing, and ingestion normalizes them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorPayload {
    pub temperature: Option<Value>,
    pub humidity: Option<Value>,
    pub soil_moisture: Option<Value>,
    pub is_rain: Option<Value>,
    pub water_level: Option<Value>,
}

/// Inbound `{status, timestamp}` report. The device clock is not trusted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusPayload {
    pub status: Option<String>,
    pub timestamp: Option<Value>,
}

//! Sensor telemetry normalization and persistence.

use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Value;
use std::sync::Arc;

use super::liveness::LivenessTracker;
use crate::bus::messages::SensorPayload;
use crate::error::{EngineError, EngineResult};
use crate::models::{NewSensorReading, WeatherCondition};
use crate::store::{DeviceDirectory, SensorStore};

pub const TEMPERATURE_RANGE: (f64, f64) = (-50.0, 100.0);
pub const PERCENT_RANGE: (f64, f64) = (0.0, 100.0);

#[derive(Clone)]
pub struct SensorIngestion {
    devices: Arc<dyn DeviceDirectory>,
    sensors: Arc<dyn SensorStore>,
    liveness: LivenessTracker,
}

impl SensorIngestion {
    pub fn new(
        devices: Arc<dyn DeviceDirectory>,
        sensors: Arc<dyn SensorStore>,
        liveness: LivenessTracker,
    ) -> Self {
        Self {
            devices,
            sensors,
            liveness,
        }
    }

    /// Persist one reading for a known device and count it as presence.
    ///
    /// `now` is the server clock; nothing in the payload is used as the
    /// reading time.
    pub async fn ingest(
        &self,
        external_id: &str,
        payload: &SensorPayload,
        now: DateTime<Utc>,
    ) -> EngineResult<NewSensorReading> {
        let device = self
            .devices
            .find_by_external_id(external_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("device {}", external_id)))?;

        let reading = normalize(device.id, payload, now);
        self.sensors.insert_reading(reading.clone()).await?;
        debug!(
            "Stored reading for {}: soil={:?} humidity={:?} temp={:?} weather={}",
            external_id,
            reading.soil_moisture,
            reading.humidity,
            reading.temperature,
            reading.weather_condition
        );

        self.liveness.mark_seen(&device, now).await?;
        Ok(reading)
    }
}

/// Clamp every numeric field into its domain and map the rain flag.
pub fn normalize(device_id: i32, payload: &SensorPayload, now: DateTime<Utc>) -> NewSensorReading {
    NewSensorReading {
        device_id,
        temperature: to_number(payload.temperature.as_ref(), TEMPERATURE_RANGE),
        humidity: to_number(payload.humidity.as_ref(), PERCENT_RANGE),
        soil_moisture: to_number(payload.soil_moisture.as_ref(), PERCENT_RANGE),
        water_level: to_number(payload.water_level.as_ref(), PERCENT_RANGE),
        weather_condition: WeatherCondition::from_rain_flag(is_truthy(payload.is_rain.as_ref()))
            .as_str()
            .to_string(),
        recorded_at: now,
    }
}

/// A JSON number or numeric string, clamped; anything else is absent.
fn to_number(value: Option<&Value>, (min, max): (f64, f64)) -> Option<f64> {
    let number = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then(|| number.clamp(min, max))
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "rain"
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceMode, Liveness};
    use crate::testing::{device, utc, MemoryStore};
    use serde_json::json;

    fn payload(value: Value) -> SensorPayload {
        serde_json::from_value(value).unwrap()
    }

    fn ingestion(store: &Arc<MemoryStore>) -> SensorIngestion {
        SensorIngestion::new(
            store.clone(),
            store.clone(),
            LivenessTracker::new(store.clone()),
        )
    }

    #[test]
    fn test_normalize_clamps_into_domains() {
        let now = utc(2024, 1, 1, 8, 0, 0);
        let reading = normalize(
            4,
            &payload(json!({
                "temperature": 140.0,
                "humidity": 104.2,
                "soilMoisture": -3,
                "waterLevel": "55.5",
                "isRain": true
            })),
            now,
        );
        assert_eq!(reading.device_id, 4);
        assert_eq!(reading.temperature, Some(100.0));
        assert_eq!(reading.humidity, Some(100.0));
        assert_eq!(reading.soil_moisture, Some(0.0));
        assert_eq!(reading.water_level, Some(55.5));
        assert_eq!(reading.weather_condition, "rain");
        assert_eq!(reading.recorded_at, now);
    }

    #[test]
    fn test_normalize_drops_non_numeric_fields() {
        let reading = normalize(
            1,
            &payload(json!({
                "temperature": "hot",
                "humidity": null,
                "soilMoisture": {"raw": 512}
            })),
            utc(2024, 1, 1, 8, 0, 0),
        );
        assert_eq!(reading.temperature, None);
        assert_eq!(reading.humidity, None);
        assert_eq!(reading.soil_moisture, None);
        assert_eq!(reading.weather_condition, "clear");
    }

    #[test]
    fn test_rain_flag_variants() {
        assert!(is_truthy(Some(&json!(true))));
        assert!(is_truthy(Some(&json!(1))));
        assert!(is_truthy(Some(&json!("TRUE"))));
        assert!(!is_truthy(Some(&json!(false))));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(!is_truthy(Some(&json!("false"))));
        assert!(!is_truthy(None));
    }

    #[tokio::test]
    async fn test_ingest_persists_with_server_time_and_touches() {
        let store = Arc::new(MemoryStore::new());
        store.add_device(device(3, "ESP32_003", DeviceMode::Auto));
        let now = utc(2024, 3, 1, 10, 30, 0);

        ingestion(&store)
            .ingest(
                "ESP32_003",
                &payload(json!({"soilMoisture": 42, "isRain": false})),
                now,
            )
            .await
            .unwrap();

        let readings = store.readings();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].recorded_at, now);
        assert_eq!(readings[0].soil_moisture, Some(42.0));

        let dev = store.device(3).unwrap();
        assert_eq!(dev.liveness(), Liveness::Online);
        assert_eq!(dev.last_seen, Some(now));
    }

    #[tokio::test]
    async fn test_ingest_unknown_device_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let err = ingestion(&store)
            .ingest("ghost", &payload(json!({"humidity": 50})), utc(2024, 1, 1, 0, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(store.readings().is_empty());
    }
}

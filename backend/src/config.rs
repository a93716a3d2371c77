//! Process configuration read from the environment.
//!
//! Binaries call `dotenvy::dotenv()` first, so a `.env` file in the working
//! directory feeds the same variables.

use chrono::Duration;
use chrono_tz::Tz;
use rumqttc::QoS;
use std::str::FromStr;

use crate::bus::mqtt::{qos_from_level, MqttConfig};
use crate::error::{EngineError, EngineResult};
use crate::services::runtime::RuntimeSettings;

pub const DEFAULT_TIMEZONE: &str = "Asia/Ho_Chi_Minh";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub mqtt: MqttConfig,
    pub mqtt_qos: QoS,
    pub timezone: Tz,
    pub schedule_tick_cron: String,
    pub pump_off_sweep_cron: String,
    pub liveness_sweep_cron: String,
    pub liveness_timeout: Duration,
    pub sensor_retention: Option<Duration>,
    pub retention_sweep_cron: String,
    pub bind_addr: String,
    pub local_run_timers: bool,
}

impl AppConfig {
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = RuntimeSettings::default();
        let mqtt_defaults = MqttConfig::default();

        let database_url = get("DATABASE_URL")
            .ok_or_else(|| EngineError::Config("DATABASE_URL must be set".to_string()))?;

        let mqtt = MqttConfig {
            broker_host: get("MQTT_BROKER_HOST").unwrap_or(mqtt_defaults.broker_host),
            broker_port: parse(&get, "MQTT_BROKER_PORT", mqtt_defaults.broker_port)?,
            client_id: get("MQTT_CLIENT_ID").unwrap_or(mqtt_defaults.client_id),
            username: get("MQTT_USERNAME"),
            password: get("MQTT_PASSWORD"),
            use_tls: parse_bool(&get, "MQTT_USE_TLS", mqtt_defaults.use_tls)?,
            keep_alive_secs: parse(&get, "MQTT_KEEP_ALIVE_SECS", mqtt_defaults.keep_alive_secs)?,
            reconnect_delay_ms: parse(
                &get,
                "MQTT_RECONNECT_DELAY_MS",
                mqtt_defaults.reconnect_delay_ms,
            )?,
        };

        let qos_level: u8 = parse(&get, "MQTT_QOS", 1)?;
        let mqtt_qos = qos_from_level(qos_level)
            .ok_or_else(|| EngineError::Config(format!("MQTT_QOS must be 0, 1 or 2, got {}", qos_level)))?;

        let tz_name = get("SCHEDULER_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        let timezone = tz_name
            .parse::<Tz>()
            .map_err(|e| EngineError::Config(format!("SCHEDULER_TIMEZONE: {}", e)))?;

        let timeout_secs: i64 = parse(
            &get,
            "LIVENESS_TIMEOUT_SECS",
            defaults.liveness_timeout.num_seconds(),
        )?;
        let liveness_timeout = Some(timeout_secs)
            .filter(|secs| *secs > 0)
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "LIVENESS_TIMEOUT_SECS must be a positive number of seconds, got {}",
                    timeout_secs
                ))
            })?;

        let sensor_retention = match get("SENSOR_RETENTION_DAYS") {
            Some(raw) => {
                let days = raw
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .filter(|days| *days > 0)
                    .and_then(Duration::try_days);
                if days.is_none() {
                    return Err(EngineError::Config(format!(
                        "SENSOR_RETENTION_DAYS must be a positive number of days, got '{}'",
                        raw
                    )));
                }
                days
            }
            None => None,
        };

        Ok(Self {
            database_url,
            mqtt,
            mqtt_qos,
            timezone,
            schedule_tick_cron: get("SCHEDULE_TICK_CRON").unwrap_or(defaults.tick_cron),
            pump_off_sweep_cron: get("PUMP_OFF_SWEEP_CRON").unwrap_or(defaults.pump_off_sweep_cron),
            liveness_sweep_cron: get("LIVENESS_SWEEP_CRON").unwrap_or(defaults.liveness_sweep_cron),
            liveness_timeout,
            sensor_retention,
            retention_sweep_cron: get("RETENTION_SWEEP_CRON").unwrap_or(defaults.retention_cron),
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            local_run_timers: parse_bool(&get, "LOCAL_RUN_TIMERS", true)?,
        })
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            tick_cron: self.schedule_tick_cron.clone(),
            pump_off_sweep_cron: self.pump_off_sweep_cron.clone(),
            liveness_sweep_cron: self.liveness_sweep_cron.clone(),
            liveness_timeout: self.liveness_timeout,
            retention: self.sensor_retention,
            retention_cron: self.retention_sweep_cron.clone(),
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> EngineResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EngineError::Config(format!("{}: {}", key, e))),
        None => Ok(default),
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> EngineResult<bool> {
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(EngineError::Config(format!("{}: expected a boolean, got '{}'", key, v))),
    }
}

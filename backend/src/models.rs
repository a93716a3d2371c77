use chrono::{DateTime, Duration, NaiveTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

// ============================================================================
// Device
// ============================================================================

#[derive(Queryable, Selectable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::devices)]
pub struct Device {
    pub id: i32,
    pub owner_id: i32,
    pub external_id: String,
    pub name: String,
    pub mode: String,
    /// Last commanded pump state.
    pub pump_intent: bool,
    /// Last observed or assumed relay state.
    pub relay_state: bool,
    pub liveness: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Parsed operating mode; unknown values read as `Off`.
    pub fn mode(&self) -> DeviceMode {
        self.mode.parse().unwrap_or(DeviceMode::Off)
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.parse().unwrap_or(Liveness::Offline)
    }

    pub fn is_schedule_mode(&self) -> bool {
        self.mode() == DeviceMode::Schedule
    }

    /// True when the pump is neither commanded nor assumed on.
    pub fn is_off(&self) -> bool {
        !self.pump_intent && !self.relay_state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    Auto,
    Manual,
    Schedule,
    Off,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Auto => "auto",
            DeviceMode::Manual => "manual",
            DeviceMode::Schedule => "schedule",
            DeviceMode::Off => "off",
        }
    }
}

impl FromStr for DeviceMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(DeviceMode::Auto),
            "manual" => Ok(DeviceMode::Manual),
            "schedule" => Ok(DeviceMode::Schedule),
            "off" => Ok(DeviceMode::Off),
            other => Err(EngineError::Validation(format!("unknown device mode '{}'", other))),
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Online,
    Offline,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Online => "online",
            Liveness::Offline => "offline",
        }
    }
}

impl FromStr for Liveness {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Liveness::Online),
            "offline" => Ok(Liveness::Offline),
            other => Err(EngineError::Validation(format!("unknown liveness '{}'", other))),
        }
    }
}

/// Restricted set of device fields the core is allowed to write.
/// `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlUpdate {
    pub mode: Option<DeviceMode>,
    pub pump_intent: Option<bool>,
    pub relay_state: Option<bool>,
    pub liveness: Option<Liveness>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ControlUpdate {
    pub fn pump(on: bool) -> Self {
        Self {
            pump_intent: Some(on),
            relay_state: Some(on),
            ..Default::default()
        }
    }

    pub fn seen(at: DateTime<Utc>) -> Self {
        Self {
            liveness: Some(Liveness::Online),
            last_seen: Some(at),
            ..Default::default()
        }
    }
}

// ============================================================================
// Schedule
// ============================================================================

pub const MIN_DURATION_MINUTES: i32 = 1;
pub const MAX_DURATION_MINUTES: i32 = 1440;

#[derive(Queryable, Selectable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::schedules)]
pub struct Schedule {
    pub id: i32,
    pub device_id: i32,
    pub owner_id: i32,
    pub name: String,
    pub description: String,
    /// Local wall-clock start, minute precision.
    pub start_time: NaiveTime,
    pub duration_minutes: i32,
    /// Weekdays, 0 = Sunday .. 6 = Saturday.
    pub days_of_week: Vec<i32>,
    pub is_active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.duration_minutes))
    }

    pub fn runs_on(&self, weekday_from_sunday: u32) -> bool {
        self.days_of_week
            .iter()
            .any(|d| u32::try_from(*d).is_ok_and(|d| d == weekday_from_sunday))
    }

    /// Rejects schedules the CRUD layer should never have stored.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&self.duration_minutes) {
            return Err(EngineError::Validation(format!(
                "schedule {} duration {} outside {}..={} minutes",
                self.id, self.duration_minutes, MIN_DURATION_MINUTES, MAX_DURATION_MINUTES
            )));
        }
        if self.days_of_week.is_empty() {
            return Err(EngineError::Validation(format!(
                "schedule {} has no days of week",
                self.id
            )));
        }
        if let Some(day) = self.days_of_week.iter().find(|d| !(0..=6).contains(*d)) {
            return Err(EngineError::Validation(format!(
                "schedule {} has invalid weekday {}",
                self.id, day
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Execution log (append-only)
// ============================================================================

#[derive(Queryable, Selectable, Serialize, Deserialize, Debug, Clone)]
#[diesel(table_name = crate::schema::schedule_executions)]
pub struct ExecutionLog {
    pub id: i32,
    pub schedule_id: i32,
    pub device_id: i32,
    pub owner_id: i32,
    pub success: bool,
    pub message: String,
    pub executed_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::schedule_executions)]
pub struct NewExecutionLog {
    pub schedule_id: i32,
    pub device_id: i32,
    pub owner_id: i32,
    pub success: bool,
    pub message: String,
    pub executed_at: DateTime<Utc>,
}

impl NewExecutionLog {
    pub fn for_schedule(
        schedule: &Schedule,
        success: bool,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            schedule_id: schedule.id,
            device_id: schedule.device_id,
            owner_id: schedule.owner_id,
            success,
            message: message.into(),
            executed_at: at,
        }
    }
}

// ============================================================================
// Active runs
// ============================================================================

/// A schedule currently commanding the pump on, keyed by schedule id.
#[derive(Queryable, Selectable, Insertable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::active_runs)]
pub struct ActiveRun {
    pub schedule_id: i32,
    pub device_id: i32,
    pub owner_id: i32,
    pub started_at: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ActiveRun {
    pub fn starting(schedule: &Schedule, started_at: DateTime<Utc>) -> Self {
        Self {
            schedule_id: schedule.id,
            device_id: schedule.device_id,
            owner_id: schedule.owner_id,
            started_at,
            end_time: started_at + schedule.duration(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.end_time <= now
    }
}

// ============================================================================
// Sensor readings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    Rain,
    Clear,
}

impl WeatherCondition {
    pub fn from_rain_flag(is_rain: bool) -> Self {
        if is_rain {
            WeatherCondition::Rain
        } else {
            WeatherCondition::Clear
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WeatherCondition::Rain => "rain",
            WeatherCondition::Clear => "clear",
        }
    }
}

#[derive(Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::sensor_readings)]
pub struct NewSensorReading {
    pub device_id: i32,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub water_level: Option<f64>,
    pub weather_condition: String,
    pub recorded_at: DateTime<Utc>,
}

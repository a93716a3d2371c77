//! In-memory collaborators and fixtures for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::bus::{BusStatus, CommandBus, Publisher, QoS};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ActiveRun, ControlUpdate, Device, DeviceMode, ExecutionLog, NewExecutionLog, NewSensorReading, Schedule,
};
use crate::services::engine::ScheduleEngine;
use crate::store::{ActiveRunStore, DeviceDirectory, ScheduleStore, SensorStore, Stores};

pub fn utc(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, min, sec).unwrap()
}

pub fn device(id: i32, external_id: &str, mode: DeviceMode) -> Device {
    let created = utc(2023, 12, 1, 0, 0, 0);
    Device {
        id,
        owner_id: 1,
        external_id: external_id.to_string(),
        name: format!("Pump {}", external_id),
        mode: mode.as_str().to_string(),
        pump_intent: false,
        relay_state: false,
        liveness: "offline".to_string(),
        last_seen: None,
        created_at: created,
        updated_at: created,
    }
}

pub fn schedule(
    id: i32,
    device_id: i32,
    (hour, minute): (u32, u32),
    duration_minutes: i32,
    days_of_week: Vec<i32>,
) -> Schedule {
    let created = utc(2023, 12, 1, 0, 0, 0);
    Schedule {
        id,
        device_id,
        owner_id: 1,
        name: format!("Schedule {}", id),
        description: String::new(),
        start_time: NaiveTime::from_hms_opt(hour, minute, 0).unwrap(),
        duration_minutes,
        days_of_week,
        is_active: true,
        last_run: None,
        next_run: None,
        created_at: created,
        updated_at: created,
    }
}

#[derive(Default)]
struct MemoryState {
    devices: BTreeMap<i32, Device>,
    schedules: BTreeMap<i32, Schedule>,
    logs: Vec<NewExecutionLog>,
    runs: BTreeMap<i32, ActiveRun>,
    readings: Vec<NewSensorReading>,
    device_writes: usize,
    fail_device_writes: bool,
    fail_run_writes: bool,
}

/// Every repository trait over one mutex-guarded state.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_device(&self, device: Device) {
        self.with(|s| s.devices.insert(device.id, device));
    }

    pub fn add_schedule(&self, schedule: Schedule) {
        self.with(|s| s.schedules.insert(schedule.id, schedule));
    }

    pub fn insert_run(&self, run: ActiveRun) {
        self.with(|s| s.runs.insert(run.schedule_id, run));
    }

    pub fn device(&self, id: i32) -> Option<Device> {
        self.with(|s| s.devices.get(&id).cloned())
    }

    pub fn schedule(&self, id: i32) -> Option<Schedule> {
        self.with(|s| s.schedules.get(&id).cloned())
    }

    pub fn logs(&self) -> Vec<NewExecutionLog> {
        self.with(|s| s.logs.clone())
    }

    pub fn runs(&self) -> Vec<ActiveRun> {
        self.with(|s| s.runs.values().cloned().collect())
    }

    pub fn readings(&self) -> Vec<NewSensorReading> {
        self.with(|s| s.readings.clone())
    }

    /// Number of control-field writes issued through the trait.
    pub fn device_writes(&self) -> usize {
        self.with(|s| s.device_writes)
    }

    pub fn set_device_mode(&self, id: i32, mode: DeviceMode) {
        self.with(|s| {
            if let Some(d) = s.devices.get_mut(&id) {
                d.mode = mode.as_str().to_string();
            }
        });
    }

    pub fn set_schedule_active(&self, id: i32, active: bool) {
        self.with(|s| {
            if let Some(schedule) = s.schedules.get_mut(&id) {
                schedule.is_active = active;
            }
        });
    }

    pub fn set_fail_device_writes(&self, fail: bool) {
        self.with(|s| s.fail_device_writes = fail);
    }

    pub fn set_fail_run_writes(&self, fail: bool) {
        self.with(|s| s.fail_run_writes = fail);
    }
}

fn injected() -> EngineError {
    EngineError::Persistence("injected failure".to_string())
}

#[async_trait]
impl DeviceDirectory for MemoryStore {
    async fn find_by_external_id(&self, external_id: &str) -> EngineResult<Option<Device>> {
        Ok(self.with(|s| {
            s.devices
                .values()
                .find(|d| d.external_id == external_id)
                .cloned()
        }))
    }

    async fn find_by_id_for_owner(&self, id: i32, owner_id: i32) -> EngineResult<Option<Device>> {
        Ok(self.with(|s| {
            s.devices
                .get(&id)
                .filter(|d| d.owner_id == owner_id)
                .cloned()
        }))
    }

    async fn update_control_fields(&self, id: i32, update: &ControlUpdate) -> EngineResult<bool> {
        self.with(|s| {
            if s.fail_device_writes {
                return Err(injected());
            }
            s.device_writes += 1;
            let Some(d) = s.devices.get_mut(&id) else {
                return Ok(false);
            };
            if let Some(mode) = update.mode {
                d.mode = mode.as_str().to_string();
            }
            if let Some(on) = update.pump_intent {
                d.pump_intent = on;
            }
            if let Some(on) = update.relay_state {
                d.relay_state = on;
            }
            if let Some(liveness) = update.liveness {
                d.liveness = liveness.as_str().to_string();
            }
            if let Some(at) = update.last_seen {
                d.last_seen = Some(at);
            }
            Ok(true)
        })
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        Ok(self.with(|s| {
            let mut changed = 0;
            for d in s.devices.values_mut() {
                let stale = d.last_seen.is_none_or(|seen| seen < cutoff);
                if d.liveness == "online" && stale {
                    d.liveness = "offline".to_string();
                    changed += 1;
                }
            }
            changed
        }))
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn list_active(&self) -> EngineResult<Vec<Schedule>> {
        Ok(self.with(|s| {
            s.schedules
                .values()
                .filter(|schedule| schedule.is_active)
                .cloned()
                .collect()
        }))
    }

    async fn find_by_id(&self, id: i32) -> EngineResult<Option<Schedule>> {
        Ok(self.schedule(id))
    }

    async fn update_run_timestamps(
        &self,
        id: i32,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        self.with(|s| {
            if let Some(schedule) = s.schedules.get_mut(&id) {
                schedule.last_run = Some(last_run);
                schedule.next_run = next_run;
            }
        });
        Ok(())
    }

    async fn append_execution_log(&self, entry: NewExecutionLog) -> EngineResult<()> {
        self.with(|s| s.logs.push(entry));
        Ok(())
    }

    async fn latest_execution(&self, schedule_id: i32) -> EngineResult<Option<ExecutionLog>> {
        Ok(self.with(|s| {
            s.logs
                .iter()
                .enumerate()
                .filter(|(_, e)| e.schedule_id == schedule_id)
                .max_by_key(|(i, e)| (e.executed_at, *i))
                .map(|(i, e)| ExecutionLog {
                    id: i as i32 + 1,
                    schedule_id: e.schedule_id,
                    device_id: e.device_id,
                    owner_id: e.owner_id,
                    success: e.success,
                    message: e.message.clone(),
                    executed_at: e.executed_at,
                })
        }))
    }
}

#[async_trait]
impl ActiveRunStore for MemoryStore {
    async fn upsert_run(&self, run: &ActiveRun) -> EngineResult<()> {
        self.with(|s| {
            if s.fail_run_writes {
                return Err(injected());
            }
            s.runs.insert(run.schedule_id, run.clone());
            Ok(())
        })
    }

    async fn find_run(&self, schedule_id: i32) -> EngineResult<Option<ActiveRun>> {
        Ok(self.with(|s| s.runs.get(&schedule_id).cloned()))
    }

    async fn list_runs(&self) -> EngineResult<Vec<ActiveRun>> {
        Ok(self.runs())
    }

    async fn list_due_runs(&self, now: DateTime<Utc>) -> EngineResult<Vec<ActiveRun>> {
        Ok(self.with(|s| s.runs.values().filter(|r| r.is_due(now)).cloned().collect()))
    }

    async fn remove_run(&self, schedule_id: i32) -> EngineResult<bool> {
        self.with(|s| {
            if s.fail_run_writes {
                return Err(injected());
            }
            Ok(s.runs.remove(&schedule_id).is_some())
        })
    }
}

#[async_trait]
impl SensorStore for MemoryStore {
    async fn insert_reading(&self, reading: NewSensorReading) -> EngineResult<()> {
        self.with(|s| s.readings.push(reading));
        Ok(())
    }

    async fn delete_readings_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        Ok(self.with(|s| {
            let before = s.readings.len();
            s.readings.retain(|r| r.recorded_at >= cutoff);
            before - s.readings.len()
        }))
    }
}

/// Publisher that records what it was handed, JSON-decoded.
pub struct RecordingPublisher {
    connected: AtomicBool,
    sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    /// The `action` field of every published command, in order.
    pub fn actions(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|(_, payload)| payload["action"].as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &[u8], _qos: QoS) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let value = serde_json::from_slice(payload).unwrap_or(Value::Null);
        self.sent.lock().unwrap().push((topic.to_string(), value));
        true
    }

    fn status(&self) -> BusStatus {
        BusStatus {
            connected: self.connected.load(Ordering::SeqCst),
            broker: "memory:0".to_string(),
            client_id: "recording".to_string(),
            subscribed_topics: Vec::new(),
        }
    }

    async fn shutdown(&self) {
        self.set_connected(false);
    }
}

/// Engine wired to an in-memory store and a recording publisher, in UTC.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub bus: CommandBus,
    pub engine: ScheduleEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(false)
    }

    pub fn with_timers() -> Self {
        Self::build(true)
    }

    fn build(local_timers: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let bus = CommandBus::new(publisher.clone(), QoS::AtLeastOnce);
        let engine = ScheduleEngine::new(
            &Stores::shared(store.clone()),
            bus.clone(),
            chrono_tz::UTC,
            local_timers,
        );
        Self {
            store,
            publisher,
            bus,
            engine,
        }
    }

    pub fn stores(&self) -> Stores {
        Stores::shared(self.store.clone())
    }
}

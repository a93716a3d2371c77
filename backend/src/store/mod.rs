//! Repository interfaces for the persistence collaborators.
//!
//! The engine, the liveness tracker and sensor ingestion receive these as
//! `Arc<dyn …>` so the same code runs against Postgres in production and the
//! in-memory store in tests. Every write is expected to be atomic per record:
//! the dispatch loop and the periodic tasks call into the same store
//! concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::EngineResult;
use crate::models::{
    ActiveRun, ControlUpdate, Device, ExecutionLog, NewExecutionLog, NewSensorReading, Schedule,
};

pub mod postgres;

pub use postgres::PgStore;

/// The four repositories, bundled for wiring.
#[derive(Clone)]
pub struct Stores {
    pub devices: Arc<dyn DeviceDirectory>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub runs: Arc<dyn ActiveRunStore>,
    pub sensors: Arc<dyn SensorStore>,
}

impl Stores {
    /// All four roles served by one backing store.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: DeviceDirectory + ScheduleStore + ActiveRunStore + SensorStore + 'static,
    {
        Self {
            devices: store.clone(),
            schedules: store.clone(),
            runs: store.clone(),
            sensors: store,
        }
    }
}

/// Device identity, operating mode and the control/liveness fields.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn find_by_external_id(&self, external_id: &str) -> EngineResult<Option<Device>>;

    async fn find_by_id_for_owner(&self, id: i32, owner_id: i32) -> EngineResult<Option<Device>>;

    /// Applies the non-`None` fields; returns false when no row matched.
    async fn update_control_fields(&self, id: i32, update: &ControlUpdate) -> EngineResult<bool>;

    /// Flips every online device last seen before `cutoff` (or never) to
    /// offline; returns how many changed.
    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> EngineResult<usize>;
}

/// Schedules and their append-only execution history.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn list_active(&self) -> EngineResult<Vec<Schedule>>;

    async fn find_by_id(&self, id: i32) -> EngineResult<Option<Schedule>>;

    async fn update_run_timestamps(
        &self,
        id: i32,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> EngineResult<()>;

    async fn append_execution_log(&self, entry: NewExecutionLog) -> EngineResult<()>;

    /// Most recent execution attempt of a schedule, successful or not.
    async fn latest_execution(&self, schedule_id: i32) -> EngineResult<Option<ExecutionLog>>;
}

/// Persisted table of in-flight watering runs keyed by schedule id.
#[async_trait]
pub trait ActiveRunStore: Send + Sync {
    /// Inserts or replaces the entry for `run.schedule_id`.
    async fn upsert_run(&self, run: &ActiveRun) -> EngineResult<()>;

    async fn find_run(&self, schedule_id: i32) -> EngineResult<Option<ActiveRun>>;

    async fn list_runs(&self) -> EngineResult<Vec<ActiveRun>>;

    /// Entries whose end time is at or before `now`.
    async fn list_due_runs(&self, now: DateTime<Utc>) -> EngineResult<Vec<ActiveRun>>;

    /// Returns false when there was nothing to remove.
    async fn remove_run(&self, schedule_id: i32) -> EngineResult<bool>;
}

/// Telemetry persistence.
#[async_trait]
pub trait SensorStore: Send + Sync {
    async fn insert_reading(&self, reading: NewSensorReading) -> EngineResult<()>;

    async fn delete_readings_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize>;
}

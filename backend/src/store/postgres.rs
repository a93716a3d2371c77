//! Diesel-backed implementation of every repository trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use log::debug;

use super::{ActiveRunStore, DeviceDirectory, ScheduleStore, SensorStore};
use crate::db::DbPool;
use crate::error::EngineResult;
use crate::models::{
    ActiveRun, ControlUpdate, Device, ExecutionLog, Liveness, NewExecutionLog, NewSensorReading, Schedule,
};
use crate::schema::{active_runs, devices, schedule_executions, schedules, sensor_readings};

type PgPooled = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(AsChangeset)]
#[diesel(table_name = devices)]
struct DeviceChangeset<'a> {
    mode: Option<&'a str>,
    pump_intent: Option<bool>,
    relay_state: Option<bool>,
    liveness: Option<&'a str>,
    last_seen: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'a> DeviceChangeset<'a> {
    fn from_update(update: &'a ControlUpdate) -> Self {
        Self {
            mode: update.mode.map(|m| m.as_str()),
            pump_intent: update.pump_intent,
            relay_state: update.relay_state,
            liveness: update.liveness.map(|l| l.as_str()),
            last_seen: update.last_seen,
            updated_at: Utc::now(),
        }
    }
}

/// Postgres store shared by all engine components.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> EngineResult<PgPooled> {
        Ok(self.pool.get()?)
    }
}

#[async_trait]
impl DeviceDirectory for PgStore {
    async fn find_by_external_id(&self, external_id: &str) -> EngineResult<Option<Device>> {
        let mut conn = self.conn()?;
        let device = devices::table
            .filter(devices::external_id.eq(external_id))
            .select(Device::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(device)
    }

    async fn find_by_id_for_owner(&self, id: i32, owner_id: i32) -> EngineResult<Option<Device>> {
        let mut conn = self.conn()?;
        let device = devices::table
            .filter(devices::id.eq(id))
            .filter(devices::owner_id.eq(owner_id))
            .select(Device::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(device)
    }

    async fn update_control_fields(&self, id: i32, update: &ControlUpdate) -> EngineResult<bool> {
        let mut conn = self.conn()?;
        let changed = diesel::update(devices::table.filter(devices::id.eq(id)))
            .set(DeviceChangeset::from_update(update))
            .execute(&mut conn)?;
        Ok(changed > 0)
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let mut conn = self.conn()?;
        let changed = diesel::update(
            devices::table
                .filter(devices::liveness.eq(Liveness::Online.as_str()))
                .filter(
                    devices::last_seen
                        .is_null()
                        .or(devices::last_seen.assume_not_null().lt(cutoff)),
                ),
        )
        .set((
            devices::liveness.eq(Liveness::Offline.as_str()),
            devices::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)?;
        Ok(changed)
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn list_active(&self) -> EngineResult<Vec<Schedule>> {
        let mut conn = self.conn()?;
        let rows = schedules::table
            .filter(schedules::is_active.eq(true))
            .order(schedules::id.asc())
            .select(Schedule::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    async fn find_by_id(&self, id: i32) -> EngineResult<Option<Schedule>> {
        let mut conn = self.conn()?;
        let schedule = schedules::table
            .filter(schedules::id.eq(id))
            .select(Schedule::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(schedule)
    }

    async fn update_run_timestamps(
        &self,
        id: i32,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        let mut conn = self.conn()?;
        diesel::update(schedules::table.filter(schedules::id.eq(id)))
            .set((
                schedules::last_run.eq(Some(last_run)),
                schedules::next_run.eq(next_run),
                schedules::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    async fn append_execution_log(&self, entry: NewExecutionLog) -> EngineResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(schedule_executions::table)
            .values(&entry)
            .execute(&mut conn)?;
        Ok(())
    }

    async fn latest_execution(&self, schedule_id: i32) -> EngineResult<Option<ExecutionLog>> {
        let mut conn = self.conn()?;
        let entry = schedule_executions::table
            .filter(schedule_executions::schedule_id.eq(schedule_id))
            .order((schedule_executions::executed_at.desc(), schedule_executions::id.desc()))
            .select(ExecutionLog::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(entry)
    }
}

#[async_trait]
impl ActiveRunStore for PgStore {
    async fn upsert_run(&self, run: &ActiveRun) -> EngineResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(active_runs::table)
            .values(run)
            .on_conflict(active_runs::schedule_id)
            .do_update()
            .set((
                active_runs::device_id.eq(run.device_id),
                active_runs::owner_id.eq(run.owner_id),
                active_runs::started_at.eq(run.started_at),
                active_runs::end_time.eq(run.end_time),
            ))
            .execute(&mut conn)?;
        debug!(
            "Registered active run for schedule {} until {}",
            run.schedule_id, run.end_time
        );
        Ok(())
    }

    async fn find_run(&self, schedule_id: i32) -> EngineResult<Option<ActiveRun>> {
        let mut conn = self.conn()?;
        let run = active_runs::table
            .filter(active_runs::schedule_id.eq(schedule_id))
            .select(ActiveRun::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(run)
    }

    async fn list_runs(&self) -> EngineResult<Vec<ActiveRun>> {
        let mut conn = self.conn()?;
        let runs = active_runs::table
            .order(active_runs::end_time.asc())
            .select(ActiveRun::as_select())
            .load(&mut conn)?;
        Ok(runs)
    }

    async fn list_due_runs(&self, now: DateTime<Utc>) -> EngineResult<Vec<ActiveRun>> {
        let mut conn = self.conn()?;
        let runs = active_runs::table
            .filter(active_runs::end_time.le(now))
            .order(active_runs::end_time.asc())
            .select(ActiveRun::as_select())
            .load(&mut conn)?;
        Ok(runs)
    }

    async fn remove_run(&self, schedule_id: i32) -> EngineResult<bool> {
        let mut conn = self.conn()?;
        let removed =
            diesel::delete(active_runs::table.filter(active_runs::schedule_id.eq(schedule_id)))
                .execute(&mut conn)?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl SensorStore for PgStore {
    async fn insert_reading(&self, reading: NewSensorReading) -> EngineResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(sensor_readings::table)
            .values(&reading)
            .execute(&mut conn)?;
        Ok(())
    }

    async fn delete_readings_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let mut conn = self.conn()?;
        let removed = diesel::delete(sensor_readings::table.filter(sensor_readings::recorded_at.lt(cutoff)))
            .execute(&mut conn)?;
        Ok(removed)
    }
}

use crate::{
    bus::{messages::CommandPayload, CommandBus},
    error::{EngineError, EngineResult},
    models::{ActiveRun, ControlUpdate, Device, NewExecutionLog, Schedule},
    store::{ActiveRunStore, DeviceDirectory, ScheduleStore, Stores},
};
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use log::{debug, error, info, warn};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// A schedule that fired less than this long ago is not fired again.
pub const DEDUP_WINDOW_SECS: i64 = 60;

/// Upper bound of the forward scan in [`compute_next_run`].
pub const NEXT_RUN_SCAN_DAYS: i64 = 7;

/// Extra wait past a run's end time before a local timer re-checks it.
const TIMER_SLACK_MS: u64 = 500;

/// Result of executing one schedule
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub schedule_id: i32,
    pub success: bool,
    pub message: String,
}

/// How one due ActiveRun entry was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    TurnedOff,
    Dropped(String),
    NotDue,
}

/// Counts from one pump-off sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub turned_off: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// The schedule engine that fires watering runs and ends them
#[derive(Clone)]
pub struct ScheduleEngine {
    schedules: Arc<dyn ScheduleStore>,
    devices: Arc<dyn DeviceDirectory>,
    runs: Arc<dyn ActiveRunStore>,
    bus: CommandBus,
    timezone: Tz,
    local_timers: bool,
    timers: Arc<Mutex<HashMap<i32, JoinHandle<()>>>>,
}

impl ScheduleEngine {
    pub fn new(stores: &Stores, bus: CommandBus, timezone: Tz, local_timers: bool) -> Self {
        Self {
            schedules: stores.schedules.clone(),
            devices: stores.devices.clone(),
            runs: stores.runs.clone(),
            bus,
            timezone,
            local_timers,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one scheduling pass - fire every active schedule whose slot is `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<ExecutionResult> {
        let mut results = Vec::new();

        let schedules = match self.schedules.list_active().await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to load active schedules: {}", e);
                return results;
            }
        };

        debug!("Tick at {}: {} active schedules", now, schedules.len());

        for schedule in schedules {
            if !schedule.is_active {
                continue;
            }

            if let Err(e) = schedule.validate() {
                warn!("Skipping schedule {}: {}", schedule.id, e);
                continue;
            }

            if !matches_slot(&schedule, now, &self.timezone) {
                continue;
            }

            // Failed attempts leave last_run untouched, so the log decides too.
            let last_attempt = match self.schedules.latest_execution(schedule.id).await {
                Ok(entry) => entry.map(|e| e.executed_at),
                Err(e) => {
                    error!(
                        "Could not check execution history of schedule {}: {}",
                        schedule.id, e
                    );
                    continue;
                }
            };
            if let Some(at) = fired_recently(schedule.last_run.max(last_attempt), now) {
                debug!("Schedule {} already attempted at {}, skipping", schedule.id, at);
                continue;
            }

            match self.runs.find_run(schedule.id).await {
                Ok(Some(run)) if !run.is_due(now) => {
                    debug!(
                        "Schedule {} still running until {}, skipping",
                        schedule.id, run.end_time
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Could not check active run for schedule {}: {}", schedule.id, e);
                    continue;
                }
            }

            info!(
                "Schedule '{}' (id={}) matched at {}",
                schedule.name,
                schedule.id,
                now.with_timezone(&self.timezone).format("%a %H:%M")
            );
            results.push(self.execute(&schedule, now).await);
        }

        results
    }

    /// Execute one schedule and append exactly one execution log entry.
    pub async fn execute(&self, schedule: &Schedule, now: DateTime<Utc>) -> ExecutionResult {
        let (success, message) = match self.try_execute(schedule, now).await {
            Ok(message) => {
                info!("Schedule {} started: {}", schedule.id, message);
                (true, message)
            }
            Err(e) => {
                error!("Schedule {} failed: {}", schedule.id, e);
                (false, e.to_string())
            }
        };

        let entry = NewExecutionLog::for_schedule(schedule, success, message.clone(), now);
        if let Err(e) = self.schedules.append_execution_log(entry).await {
            error!("Failed to log execution of schedule {}: {}", schedule.id, e);
        }

        ExecutionResult {
            schedule_id: schedule.id,
            success,
            message,
        }
    }

    async fn try_execute(&self, schedule: &Schedule, now: DateTime<Utc>) -> EngineResult<String> {
        let device = self
            .devices
            .find_by_id_for_owner(schedule.device_id, schedule.owner_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "device {} for schedule {}",
                    schedule.device_id, schedule.id
                ))
            })?;

        if !device.is_schedule_mode() {
            return Err(EngineError::Validation(format!(
                "device {} is in {} mode, not schedule",
                device.external_id,
                device.mode()
            )));
        }

        if !self
            .bus
            .send_command(&device.external_id, &CommandPayload::pump_on(now))
            .await
        {
            return Err(EngineError::Transport(format!(
                "pump_on to {} was not published",
                device.external_id
            )));
        }

        match self
            .devices
            .update_control_fields(device.id, &ControlUpdate::pump(true))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.compensate(&device, now).await;
                return Err(EngineError::NotFound(format!(
                    "device {} vanished while starting",
                    device.external_id
                )));
            }
            Err(e) => {
                self.compensate(&device, now).await;
                return Err(e);
            }
        }

        let run = ActiveRun::starting(schedule, now);
        if let Err(e) = self.runs.upsert_run(&run).await {
            self.compensate(&device, now).await;
            return Err(e);
        }

        let next_run = compute_next_run(schedule, now, &self.timezone);
        if let Err(e) = self
            .schedules
            .update_run_timestamps(schedule.id, now, next_run)
            .await
        {
            // The run is registered; the sweep still ends it.
            error!(
                "Failed to record run timestamps for schedule {}: {}",
                schedule.id, e
            );
        }

        if self.local_timers {
            self.arm_timer(&run);
        }

        Ok(format!(
            "pump on for {} min on {}, ends at {}",
            schedule.duration_minutes, device.external_id, run.end_time
        ))
    }

    /// Undo a pump_on whose backing state could not be persisted.
    async fn compensate(&self, device: &Device, now: DateTime<Utc>) {
        warn!("Rolling back pump_on for {}", device.external_id);
        if !self
            .bus
            .send_command(&device.external_id, &CommandPayload::pump_off(now))
            .await
        {
            error!("Compensating pump_off to {} was not published", device.external_id);
        }
        if let Err(e) = self
            .devices
            .update_control_fields(device.id, &ControlUpdate::pump(false))
            .await
        {
            error!("Failed to clear pump state of {}: {}", device.external_id, e);
        }
    }

    /// End the run of `schedule_id` on `device`. Safe to repeat.
    ///
    /// A refused publish leaves the ActiveRun entry in place for the next sweep.
    pub async fn turn_off(
        &self,
        schedule_id: i32,
        device: &Device,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        if !self
            .bus
            .send_command(&device.external_id, &CommandPayload::pump_off(now))
            .await
        {
            return Err(EngineError::Transport(format!(
                "pump_off to {} was not published",
                device.external_id
            )));
        }

        if !device.is_off() {
            self.devices
                .update_control_fields(device.id, &ControlUpdate::pump(false))
                .await?;
        }

        if self.runs.remove_run(schedule_id).await? {
            info!("Schedule {} finished, pump off on {}", schedule_id, device.external_id);
        } else {
            debug!("Schedule {} had no active run left", schedule_id);
        }
        Ok(())
    }

    /// Re-validate one due entry against persisted state and end or drop it.
    pub async fn settle_run(&self, run: &ActiveRun, now: DateTime<Utc>) -> EngineResult<Settlement> {
        if !run.is_due(now) {
            return Ok(Settlement::NotDue);
        }

        let device = match self
            .devices
            .find_by_id_for_owner(run.device_id, run.owner_id)
            .await?
        {
            Some(d) if d.is_schedule_mode() => d,
            Some(d) => {
                return self
                    .drop_run(run, format!("device {} left schedule mode", d.external_id))
                    .await
            }
            None => {
                return self
                    .drop_run(run, format!("device {} no longer exists", run.device_id))
                    .await
            }
        };

        match self.schedules.find_by_id(run.schedule_id).await? {
            Some(s) if s.is_active => {}
            Some(_) => return self.drop_run(run, "schedule deactivated".to_string()).await,
            None => return self.drop_run(run, "schedule deleted".to_string()).await,
        }

        let overlapping = self
            .runs
            .list_runs()
            .await?
            .into_iter()
            .find(|r| {
                r.device_id == run.device_id && r.schedule_id != run.schedule_id && !r.is_due(now)
            });
        if let Some(other) = overlapping {
            return self
                .drop_run(
                    run,
                    format!(
                        "device {} is driven by schedule {} until {}",
                        device.external_id, other.schedule_id, other.end_time
                    ),
                )
                .await;
        }

        self.turn_off(run.schedule_id, &device, now).await?;
        Ok(Settlement::TurnedOff)
    }

    async fn drop_run(&self, run: &ActiveRun, reason: String) -> EngineResult<Settlement> {
        self.runs.remove_run(run.schedule_id).await?;
        info!("Dropped active run of schedule {}: {}", run.schedule_id, reason);
        Ok(Settlement::Dropped(reason))
    }

    /// Authoritative pass over every ActiveRun entry whose end time has passed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let due = match self.runs.list_due_runs(now).await {
            Ok(runs) => runs,
            Err(e) => {
                error!("Failed to load due runs: {}", e);
                return report;
            }
        };

        for run in due {
            match self.settle_run(&run, now).await {
                Ok(Settlement::TurnedOff) => {
                    report.turned_off += 1;
                    self.cancel_timer(run.schedule_id);
                }
                Ok(Settlement::Dropped(_)) => {
                    report.dropped += 1;
                    self.cancel_timer(run.schedule_id);
                }
                Ok(Settlement::NotDue) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        "Could not end run of schedule {} (retrying next sweep): {}",
                        run.schedule_id, e
                    );
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                "Pump-off sweep: {} turned off, {} dropped, {} failed",
                report.turned_off, report.dropped, report.failed
            );
        }
        report
    }

    /// Settle the persisted entry of `schedule_id` if it is due.
    pub async fn finish_run(&self, schedule_id: i32, now: DateTime<Utc>) -> EngineResult<Settlement> {
        match self.runs.find_run(schedule_id).await? {
            Some(run) => self.settle_run(&run, now).await,
            None => Ok(Settlement::NotDue),
        }
    }

    /// Rebuild ActiveRun entries lost in a crash and re-arm local timers.
    ///
    /// A device counts as mid-run when its relay is still on and it is in
    /// schedule mode; the active schedule with the latest `last_run` on that
    /// device owns the run. Devices that already have an entry are left alone.
    pub async fn recover(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut runs = self.runs.list_runs().await?;
        let mut covered: HashSet<i32> = runs.iter().map(|r| r.device_id).collect();

        let mut candidates: Vec<Schedule> = self
            .schedules
            .list_active()
            .await?
            .into_iter()
            .filter(|s| s.last_run.is_some())
            .collect();
        candidates.sort_by_key(|s| Reverse(s.last_run));

        let mut rebuilt = 0;
        for schedule in candidates {
            let Some(last_run) = schedule.last_run else {
                continue;
            };
            if covered.contains(&schedule.device_id) {
                continue;
            }

            let device = match self
                .devices
                .find_by_id_for_owner(schedule.device_id, schedule.owner_id)
                .await
            {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Recovery could not load device {}: {}", schedule.device_id, e);
                    continue;
                }
            };
            if !device.relay_state || !device.is_schedule_mode() {
                continue;
            }

            let run = ActiveRun::starting(&schedule, last_run);
            if let Err(e) = self.runs.upsert_run(&run).await {
                error!(
                    "Could not restore run of schedule {} on {}: {}",
                    schedule.id, device.external_id, e
                );
                continue;
            }
            info!(
                "Recovered run of schedule {} on {} (ends {})",
                schedule.id, device.external_id, run.end_time
            );
            covered.insert(schedule.device_id);
            runs.push(run);
            rebuilt += 1;
        }

        if self.local_timers {
            for run in runs.iter().filter(|r| !r.is_due(now)) {
                self.arm_timer(run);
            }
        }

        Ok(rebuilt)
    }

    /// Spawn a best-effort timer that settles `run` shortly after it ends.
    pub fn arm_timer(&self, run: &ActiveRun) {
        let delay = (run.end_time - Utc::now()).to_std().unwrap_or_default()
            + std::time::Duration::from_millis(TIMER_SLACK_MS);
        let schedule_id = run.schedule_id;
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.lock_timers().remove(&schedule_id);
            match engine.finish_run(schedule_id, Utc::now()).await {
                Ok(Settlement::NotDue) => {}
                Ok(outcome) => debug!("Timer for schedule {}: {:?}", schedule_id, outcome),
                Err(e) => warn!("Timer for schedule {} deferred to sweep: {}", schedule_id, e),
            }
        });

        if let Some(previous) = self.lock_timers().insert(schedule_id, handle) {
            previous.abort();
        }
    }

    pub fn cancel_timer(&self, schedule_id: i32) {
        if let Some(handle) = self.lock_timers().remove(&schedule_id) {
            handle.abort();
        }
    }

    pub fn cancel_all_timers(&self) {
        for (_, handle) in self.lock_timers().drain() {
            handle.abort();
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.lock_timers().len()
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<i32, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// True when `now`, in `tz`, falls on one of the schedule's weekdays in the
/// minute of its start time.
pub fn matches_slot(schedule: &Schedule, now: DateTime<Utc>, tz: &Tz) -> bool {
    let local = now.with_timezone(tz);
    schedule.runs_on(local.weekday().num_days_from_sunday())
        && local.hour() == schedule.start_time.hour()
        && local.minute() == schedule.start_time.minute()
}

/// The last attempt, when it lies inside the dedup window before `now`.
fn fired_recently(
    last_attempt: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    last_attempt.filter(|last| now - *last < Duration::seconds(DEDUP_WINDOW_SECS))
}

/// Earliest start strictly after `now` within the next 7 days, or `None`.
pub fn compute_next_run(schedule: &Schedule, now: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
    let start = NaiveTime::from_hms_opt(schedule.start_time.hour(), schedule.start_time.minute(), 0)?;
    let today = now.with_timezone(tz).date_naive();

    for offset in 0..=NEXT_RUN_SCAN_DAYS {
        let date = today + Duration::days(offset);
        if !schedule.runs_on(date.weekday().num_days_from_sunday()) {
            continue;
        }

        let candidate = match tz.from_local_datetime(&date.and_time(start)) {
            LocalResult::Single(t) => t,
            LocalResult::Ambiguous(earliest, _) => earliest,
            // start time falls in a DST gap that day
            LocalResult::None => continue,
        };
        let candidate = candidate.with_timezone(&Utc);
        if candidate > now {
            return Some(candidate);
        }
    }

    None
}

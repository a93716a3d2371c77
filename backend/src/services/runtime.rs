//! Process runtime: periodic jobs, the inbound dispatch task and the outbound
//! surface used by request handlers.
//!
//! Jobs (cron expressions are evaluated in UTC):
//! - schedule tick: every minute at :00
//! - pump-off sweep: every minute at :00
//! - liveness sweep: every 30 seconds
//! - sensor retention: daily at 03:00, only when a retention window is set
//!
//! Each job skips a trigger while its previous run is still executing.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use log::{error, info, warn};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};

use super::engine::{ExecutionResult, ScheduleEngine};
use super::ingestion::SensorIngestion;
use super::liveness::LivenessTracker;
use crate::bus::dispatch::Dispatcher;
use crate::bus::messages::{CommandPayload, FirmwareRelease};
use crate::bus::{BusStatus, CommandBus, InboundMessage};
use crate::error::{EngineError, EngineResult};
use crate::models::{ControlUpdate, Device};
use crate::store::{DeviceDirectory, SensorStore, Stores};

/// Cron expressions and windows for the periodic jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub tick_cron: String,
    pub pump_off_sweep_cron: String,
    pub liveness_sweep_cron: String,
    pub liveness_timeout: Duration,
    pub retention: Option<Duration>,
    pub retention_cron: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            tick_cron: "0 * * * * *".to_string(),
            pump_off_sweep_cron: "0 * * * * *".to_string(),
            liveness_sweep_cron: "*/30 * * * * *".to_string(),
            liveness_timeout: Duration::seconds(60),
            retention: None,
            retention_cron: "0 0 3 * * *".to_string(),
        }
    }
}

pub struct IrrigationService {
    engine: ScheduleEngine,
    liveness: LivenessTracker,
    ingestion: SensorIngestion,
    bus: CommandBus,
    devices: Arc<dyn DeviceDirectory>,
    sensors: Arc<dyn SensorStore>,
    settings: RuntimeSettings,
    scheduler: Mutex<Option<JobScheduler>>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl IrrigationService {
    pub fn new(
        stores: Stores,
        bus: CommandBus,
        timezone: Tz,
        local_timers: bool,
        settings: RuntimeSettings,
    ) -> Self {
        let engine = ScheduleEngine::new(&stores, bus.clone(), timezone, local_timers);
        let liveness = LivenessTracker::new(stores.devices.clone());
        let ingestion =
            SensorIngestion::new(stores.devices.clone(), stores.sensors.clone(), liveness.clone());

        Self {
            engine,
            liveness,
            ingestion,
            bus,
            devices: stores.devices,
            sensors: stores.sensors,
            settings,
            scheduler: Mutex::new(None),
            dispatch_handle: Mutex::new(None),
        }
    }

    /// Recover in-flight runs, start consuming `inbound` and schedule the
    /// periodic jobs.
    pub async fn start(&self, inbound: mpsc::Receiver<InboundMessage>) -> EngineResult<()> {
        let mut scheduler_slot = self.scheduler.lock().await;
        if scheduler_slot.is_some() {
            return Err(EngineError::Scheduler("service already started".to_string()));
        }

        let now = Utc::now();
        match self.engine.recover(now).await {
            Ok(0) => info!("No interrupted watering runs to recover"),
            Ok(n) => info!("Recovered {} interrupted watering run(s)", n),
            Err(e) => warn!("Run recovery failed, relying on persisted entries: {}", e),
        }
        self.engine.sweep(now).await;

        let dispatcher = Dispatcher::new(self.ingestion.clone(), self.liveness.clone());
        *self.dispatch_handle.lock().await = Some(tokio::spawn(dispatcher.run(inbound)));

        let sched = JobScheduler::new()
            .await
            .map_err(|e| EngineError::Scheduler(format!("failed to create scheduler: {}", e)))?;

        let engine = self.engine.clone();
        let tick_job = periodic_job(&self.settings.tick_cron, "schedule-tick", move || {
            let engine = engine.clone();
            async move {
                let results = engine.tick(Utc::now()).await;
                log_tick(&results);
            }
        })?;
        add_job(&sched, tick_job).await?;

        let engine = self.engine.clone();
        let sweep_job = periodic_job(
            &self.settings.pump_off_sweep_cron,
            "pump-off-sweep",
            move || {
                let engine = engine.clone();
                async move {
                    engine.sweep(Utc::now()).await;
                }
            },
        )?;
        add_job(&sched, sweep_job).await?;

        let liveness = self.liveness.clone();
        let timeout = self.settings.liveness_timeout;
        let liveness_job = periodic_job(
            &self.settings.liveness_sweep_cron,
            "liveness-sweep",
            move || {
                let liveness = liveness.clone();
                async move {
                    if let Err(e) = liveness.sweep(timeout, Utc::now()).await {
                        error!("Liveness sweep failed: {}", e);
                    }
                }
            },
        )?;
        add_job(&sched, liveness_job).await?;

        if let Some(retention) = self.settings.retention {
            let sensors = self.sensors.clone();
            let retention_job = periodic_job(
                &self.settings.retention_cron,
                "sensor-retention",
                move || {
                    let sensors = sensors.clone();
                    async move {
                        prune_readings(sensors.as_ref(), retention, Utc::now()).await;
                    }
                },
            )?;
            add_job(&sched, retention_job).await?;
        }

        sched
            .start()
            .await
            .map_err(|e| EngineError::Scheduler(format!("failed to start scheduler: {}", e)))?;

        info!("Irrigation scheduler running. Jobs scheduled:");
        info!("  - schedule-tick: {}", self.settings.tick_cron);
        info!("  - pump-off-sweep: {}", self.settings.pump_off_sweep_cron);
        info!(
            "  - liveness-sweep: {} (timeout {}s)",
            self.settings.liveness_sweep_cron,
            self.settings.liveness_timeout.num_seconds()
        );
        if let Some(retention) = self.settings.retention {
            info!(
                "  - sensor-retention: {} (keep {} days)",
                self.settings.retention_cron,
                retention.num_days()
            );
        }

        *scheduler_slot = Some(sched);
        Ok(())
    }

    /// Stop the jobs, local timers, transport and dispatch task. ActiveRun
    /// entries stay persisted for the next start.
    pub async fn stop(&self) {
        if let Some(mut sched) = self.scheduler.lock().await.take() {
            if let Err(e) = sched.shutdown().await {
                warn!("Scheduler shutdown failed: {}", e);
            }
        }
        self.engine.cancel_all_timers();
        self.bus.shutdown().await;
        if let Some(handle) = self.dispatch_handle.lock().await.take() {
            handle.abort();
        }
        info!("Irrigation service stopped");
    }

    pub async fn publish_command(&self, external_id: &str, command: &CommandPayload) -> bool {
        self.bus.send_command(external_id, command).await
    }

    pub async fn publish_config(&self, external_id: &str, config: &Value) -> bool {
        self.bus.send_config(external_id, config).await
    }

    pub async fn publish_firmware_update(&self, external_id: &str, release: &FirmwareRelease) -> bool {
        self.bus.send_firmware_update(external_id, release).await
    }

    /// Explicit command request for a known device. Pump actions also record
    /// the commanded state.
    pub async fn command_device(
        &self,
        external_id: &str,
        action: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<CommandPayload> {
        let action = action.trim();
        if action.is_empty() {
            return Err(EngineError::Validation("action must not be empty".to_string()));
        }

        let device = self.find_device(external_id).await?;
        let command = CommandPayload::new(action, now);
        if !self.publish_command(&device.external_id, &command).await {
            return Err(EngineError::Transport(format!(
                "{} to {} was not published",
                action, device.external_id
            )));
        }

        if let Some(on) = command.pump_state() {
            self.devices
                .update_control_fields(device.id, &ControlUpdate::pump(on))
                .await?;
            info!("Device {} pump commanded {}", device.external_id, action);
        }
        Ok(command)
    }

    pub async fn configure_device(&self, external_id: &str, config: &Value) -> EngineResult<()> {
        if !config.is_object() {
            return Err(EngineError::Validation(
                "configuration must be a JSON object".to_string(),
            ));
        }
        let device = self.find_device(external_id).await?;
        if !self.publish_config(&device.external_id, config).await {
            return Err(EngineError::Transport(format!(
                "config to {} was not published",
                device.external_id
            )));
        }
        Ok(())
    }

    pub async fn update_firmware(&self, external_id: &str, release: &FirmwareRelease) -> EngineResult<()> {
        if release.version.trim().is_empty() || release.url.trim().is_empty() {
            return Err(EngineError::Validation(
                "firmware version and url are required".to_string(),
            ));
        }
        let device = self.find_device(external_id).await?;
        if !self.publish_firmware_update(&device.external_id, release).await {
            return Err(EngineError::Transport(format!(
                "firmware directive to {} was not published",
                device.external_id
            )));
        }
        info!(
            "Firmware {} offered to {} ({} bytes)",
            release.version, device.external_id, release.size
        );
        Ok(())
    }

    pub fn bus_status(&self) -> BusStatus {
        self.bus.status()
    }

    async fn find_device(&self, external_id: &str) -> EngineResult<Device> {
        self.devices
            .find_by_external_id(external_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("device {}", external_id)))
    }
}

/// Wrap `task` in a cron job that never overlaps itself.
fn periodic_job<F, Fut>(cron: &str, name: &'static str, task: F) -> EngineResult<Job>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let guard = Arc::new(Mutex::new(()));
    let task = Arc::new(task);

    Job::new_async(cron, move |_uuid, _l| {
        let guard = guard.clone();
        let task = task.clone();
        Box::pin(async move {
            run_exclusive(&guard, name, task.as_ref()).await;
        })
    })
    .map_err(|e| EngineError::Scheduler(format!("invalid {} cron '{}': {}", name, cron, e)))
}

/// Run `task` unless another run holding `guard` is still in progress.
/// Returns whether the task ran.
async fn run_exclusive<F, Fut>(guard: &Mutex<()>, name: &str, task: &F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    let Ok(_running) = guard.try_lock() else {
        warn!("{} still running, skipping this trigger", name);
        return false;
    };
    task().await;
    true
}

async fn add_job(sched: &JobScheduler, job: Job) -> EngineResult<()> {
    sched
        .add(job)
        .await
        .map(|_| ())
        .map_err(|e| EngineError::Scheduler(format!("failed to add job: {}", e)))
}

fn log_tick(results: &[ExecutionResult]) {
    if results.is_empty() {
        return;
    }

    let successful = results.iter().filter(|r| r.success).count();
    info!(
        "Schedule tick: {} executed, {} successful, {} failed",
        results.len(),
        successful,
        results.len() - successful
    );

    for result in results.iter().filter(|r| !r.success) {
        error!("Schedule {} failed: {}", result.schedule_id, result.message);
    }
}

async fn prune_readings(sensors: &dyn SensorStore, retention: Duration, now: DateTime<Utc>) {
    let Some(cutoff) = now.checked_sub_signed(retention) else {
        warn!(
            "Retention window of {} days is out of range, nothing pruned",
            retention.num_days()
        );
        return;
    };
    match sensors.delete_readings_before(cutoff).await {
        Ok(0) => {}
        Ok(n) => info!("Deleted {} sensor readings older than {}", n, cutoff),
        Err(e) => error!("Sensor retention sweep failed: {}", e),
    }
}

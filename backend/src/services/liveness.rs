//! Online/offline derivation from inbound traffic.
//!
//! Only `touch` moves a device offline -> online and only `sweep` moves it
//! online -> offline.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::models::{ControlUpdate, Device, Liveness};
use crate::store::DeviceDirectory;

#[derive(Clone)]
pub struct LivenessTracker {
    devices: Arc<dyn DeviceDirectory>,
}

impl LivenessTracker {
    pub fn new(devices: Arc<dyn DeviceDirectory>) -> Self {
        Self { devices }
    }

    /// Record presence for the device with this external id.
    pub async fn touch(&self, external_id: &str, now: DateTime<Utc>) -> EngineResult<Device> {
        let device = self
            .devices
            .find_by_external_id(external_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("device {}", external_id)))?;

        self.mark_seen(&device, now).await?;
        Ok(device)
    }

    /// Record presence for an already-loaded device.
    pub async fn mark_seen(&self, device: &Device, now: DateTime<Utc>) -> EngineResult<()> {
        let updated = self
            .devices
            .update_control_fields(device.id, &ControlUpdate::seen(now))
            .await?;
        if !updated {
            return Err(EngineError::NotFound(format!("device {}", device.external_id)));
        }

        if device.liveness() == Liveness::Offline {
            info!("Device {} back online", device.external_id);
        } else {
            debug!("Device {} seen at {}", device.external_id, now);
        }
        Ok(())
    }

    /// Flip every online device silent for longer than `timeout` to offline.
    pub async fn sweep(&self, timeout: Duration, now: DateTime<Utc>) -> EngineResult<usize> {
        let cutoff = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let changed = self.devices.mark_stale_offline(cutoff).await?;
        if changed > 0 {
            info!(
                "Liveness sweep: {} device(s) marked offline (silent since before {})",
                changed, cutoff
            );
        } else {
            debug!("Liveness sweep: all online devices reported within {}s", timeout.num_seconds());
        }
        Ok(changed)
    }
}

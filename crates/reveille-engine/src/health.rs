//! Daily health-check trigger.
//!
//! A recurring, inexact trigger that runs recovery once a day so drift is
//! repaired even when no reboot happens.

use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use tracing::info;

use reveille_store::{InvalidRequest, NotificationId, next_daily_occurrence};

use crate::manager::AlarmTriggerManager;
use crate::platform::{Exactness, Repeat, TriggerHandle, TriggerRegistration, TriggerRoute};
use crate::EngineError;

/// The health-check registration that should be live at `now`.
pub fn desired_registration(
    now: DateTime<Utc>,
    hour: u32,
    minute: u32,
) -> Result<TriggerRegistration, InvalidRequest> {
    let fire_at = next_daily_occurrence(&now.with_timezone(&Local), hour, minute)
        .ok_or(InvalidRequest::InvalidTime { hour, minute })?;
    Ok(TriggerRegistration {
        id: NotificationId::HEALTH_CHECK,
        fire_at,
        exactness: Exactness::Inexact,
        repeat: Repeat::Daily,
        route: TriggerRoute::HealthCheck,
        payload: Vec::new(),
    })
}

/// Installs the daily health check.
pub struct HealthCheckScheduler {
    manager: Arc<AlarmTriggerManager>,
}

impl HealthCheckScheduler {
    pub fn new(manager: Arc<AlarmTriggerManager>) -> Self {
        Self { manager }
    }

    /// Register the recurring health check at local `hour:minute`.
    ///
    /// Re-installing replaces the previous registration.
    #[tracing::instrument(skip(self))]
    pub async fn install_recurring(
        &self,
        hour: u32,
        minute: u32,
    ) -> Result<TriggerHandle, EngineError> {
        let registration = desired_registration(Utc::now(), hour, minute)?;
        let handle = self.manager.register(registration).await?;
        info!(fire_at = %handle.fire_at, "daily health check installed");
        Ok(handle)
    }
}

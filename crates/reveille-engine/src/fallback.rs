//! Short-horizon fallback alarms.
//!
//! A safety net for moments when the primary path may not finish, such as
//! right after boot: a single best-effort trigger telling the user to check
//! their reminders. Callers can also arm a backup for one reminder, which
//! carries that reminder's own text.

use std::sync::Arc;

use chrono::{Duration, SubsecRound, Timelike, Utc};
use tracing::info;

use reveille_store::{NotificationId, NotificationRequest};

use crate::manager::{AlarmTriggerManager, registration_for};
use crate::platform::{Exactness, TriggerHandle};
use crate::EngineError;

/// Issues generic "check your reminders" alarms.
pub struct FallbackAlarmIssuer {
    manager: Arc<AlarmTriggerManager>,
    title: String,
    body: String,
}

impl FallbackAlarmIssuer {
    /// Create an issuer with the text the fallback notification shows.
    pub fn new(manager: Arc<AlarmTriggerManager>, title: String, body: String) -> Self {
        Self {
            manager,
            title,
            body,
        }
    }

    /// Schedule one inexact fallback `minutes_ahead` minutes from now.
    ///
    /// The id is the fallback slot of the fire minute, so calls within the
    /// same minute replace each other and nothing needs tracking.
    #[tracing::instrument(skip(self))]
    pub async fn issue_short_horizon_fallback(
        &self,
        minutes_ahead: u32,
    ) -> Result<TriggerHandle, EngineError> {
        let fire_at =
            (Utc::now() + Duration::minutes(i64::from(minutes_ahead))).trunc_subsecs(3);
        let slot = fire_at.num_seconds_from_midnight() / 60;
        let request = NotificationRequest::once(
            NotificationId::fallback_slot(slot),
            self.title.clone(),
            self.body.clone(),
            fire_at,
        );

        let handle = self
            .manager
            .register(registration_for(&request, fire_at, Exactness::Inexact))
            .await?;
        info!(id = %handle.id, fire_at = %handle.fire_at, "fallback alarm armed");
        Ok(handle)
    }

    /// Arm the backup trigger for `owner`, `delay_secs` seconds from now.
    ///
    /// Each caller id has one backup slot, so arming again replaces the
    /// previous backup. The notification is shown under `owner` itself and
    /// replaces whatever the primary trigger rendered there.
    #[tracing::instrument(skip(self, title, body))]
    pub async fn issue_backup(
        &self,
        owner: NotificationId,
        title: &str,
        body: &str,
        delay_secs: u32,
    ) -> Result<TriggerHandle, EngineError> {
        let slot = NotificationId::backup_for(owner)?;
        let fire_at = Utc::now() + Duration::seconds(i64::from(delay_secs));
        let request = NotificationRequest::once(owner, title, body, fire_at);

        let exactness = self.manager.preferred_exactness().await;
        let mut registration = registration_for(&request, request.fire_at, exactness);
        registration.id = slot;

        let handle = self.manager.register(registration).await?;
        info!(%owner, id = %handle.id, fire_at = %handle.fire_at, "backup alarm armed");
        Ok(handle)
    }

    /// Cancel the backup for `owner`, if one is armed.
    pub async fn retract_backup(&self, owner: NotificationId) -> Result<(), EngineError> {
        let slot = NotificationId::backup_for(owner)?;
        self.manager.cancel(slot).await
    }

    /// Cancel a fallback once the primary path has succeeded.
    pub async fn retract(&self, handle: &TriggerHandle) -> Result<(), EngineError> {
        self.manager.cancel(handle.id).await?;
        info!(id = %handle.id, "fallback alarm retracted");
        Ok(())
    }
}

//! The engine facade.
//!
//! Wires the ledger, trigger manager, renderer, fallback issuer, health check
//! and recovery runner together behind the operations a host calls.

use std::sync::Arc;

use chrono::Local;
use tracing::{info, warn};

use reveille_store::{InvalidRequest, NotificationId, NotificationRequest, ScheduleLedger};

use crate::config::EngineConfig;
use crate::fallback::FallbackAlarmIssuer;
use crate::health::HealthCheckScheduler;
use crate::manager::AlarmTriggerManager;
use crate::platform::{
    AlarmService, Exactness, NotificationSurface, PermissionPrompter, TriggerHandle, TriggerRoute,
};
use crate::recovery::{RecoveryEvent, RecoveryOutcome, RecoveryPhase, RecoveryRunner};
use crate::renderer::{Delivery, FireTimeRenderer};
use crate::EngineError;

/// Something the host should offer the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionSuggestion {
    /// The reminder was registered inexact; granting exact alarms fixes that.
    GrantExactAlarms,
}

/// Result of creating or updating a reminder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderReceipt {
    pub handle: TriggerHandle,
    pub suggestion: Option<PermissionSuggestion>,
}

/// Result of handling a fired trigger.
#[derive(Debug)]
pub enum FireOutcome {
    Rendered(Delivery),
    Recovered(RecoveryOutcome),
}

pub struct Engine {
    config: EngineConfig,
    ledger: Arc<dyn ScheduleLedger>,
    manager: Arc<AlarmTriggerManager>,
    renderer: FireTimeRenderer,
    health: HealthCheckScheduler,
    fallback: Arc<FallbackAlarmIssuer>,
    runner: RecoveryRunner,
    prompter: Arc<dyn PermissionPrompter>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn ScheduleLedger>,
        alarms: Arc<dyn AlarmService>,
        surface: Arc<dyn NotificationSurface>,
        prompter: Arc<dyn PermissionPrompter>,
    ) -> Self {
        let manager = Arc::new(AlarmTriggerManager::new(alarms));
        let fallback = Arc::new(FallbackAlarmIssuer::new(
            Arc::clone(&manager),
            config.fallback_title.clone(),
            config.fallback_body.clone(),
        ));
        let runner = RecoveryRunner::new(
            Arc::clone(&manager),
            Arc::clone(&fallback),
            Arc::clone(&ledger),
            config.clone(),
        );
        Self {
            renderer: FireTimeRenderer::new(surface, config.render.clone()),
            health: HealthCheckScheduler::new(Arc::clone(&manager)),
            config,
            ledger,
            manager,
            fallback,
            runner,
            prompter,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &AlarmTriggerManager {
        &self.manager
    }

    pub fn recovery_phase(&self) -> RecoveryPhase {
        self.runner.phase()
    }

    /// Persist `request` and register its trigger, replacing any previous one.
    ///
    /// `fire_at` is truncated to whole milliseconds, the precision of the
    /// ledger and of trigger payloads. The ledger is written first, so a crash
    /// before registration leaves something recovery can repair.
    #[tracing::instrument(skip(self, request), fields(id = %request.id))]
    pub async fn create_or_update_reminder(
        &self,
        request: NotificationRequest,
    ) -> Result<ReminderReceipt, EngineError> {
        if request.id.is_reserved() {
            return Err(InvalidRequest::ReservedId(request.id.get()).into());
        }
        let request = request.with_millisecond_precision();
        request.validate()?;

        self.ledger.upsert(&request).await?;
        let fire_at = request
            .next_fire_after(&Local::now())
            .unwrap_or(request.fire_at);
        let handle = self.manager.schedule_at(&request, fire_at).await?;

        let suggestion = (handle.exactness == Exactness::Inexact)
            .then_some(PermissionSuggestion::GrantExactAlarms);
        info!(fire_at = %handle.fire_at, exactness = ?handle.exactness, "reminder scheduled");
        Ok(ReminderReceipt { handle, suggestion })
    }

    /// Arm a one-shot backup that shows `title` and `body` under `id` after
    /// `delay_secs` seconds.
    ///
    /// The backup is independent of the ledger. It replaces any earlier
    /// backup for `id` and is dropped when the reminder is cancelled.
    pub async fn schedule_backup_reminder(
        &self,
        id: NotificationId,
        title: &str,
        body: &str,
        delay_secs: u32,
    ) -> Result<TriggerHandle, EngineError> {
        self.fallback.issue_backup(id, title, body, delay_secs).await
    }

    /// Remove a reminder, its trigger and its backup. Returns whether it existed.
    pub async fn cancel_reminder(&self, id: NotificationId) -> Result<bool, EngineError> {
        if id.is_reserved() {
            return Err(InvalidRequest::ReservedId(id.get()).into());
        }
        let existed = self.ledger.remove(id).await?;
        self.manager.cancel(id).await?;
        if id.get() <= NotificationId::MAX_BACKUP_OWNER {
            self.fallback.retract_backup(id).await?;
        }
        Ok(existed)
    }

    /// Remove every reminder, its trigger and its backup. The health check
    /// and fallbacks stay.
    pub async fn clear_all(&self) -> Result<Vec<NotificationId>, EngineError> {
        let ids = self.ledger.clear().await?;
        let live = self.manager.live_triggers().await?;
        for trigger in live
            .iter()
            .filter(|t| !t.id.is_reserved() || t.id.is_backup())
        {
            self.manager.cancel(trigger.id).await?;
        }
        info!(count = ids.len(), "all reminders cleared");
        Ok(ids)
    }

    /// Every reminder in the ledger, ordered by id.
    pub async fn reminders(&self) -> Result<Vec<NotificationRequest>, EngineError> {
        Ok(self.ledger.load().await?)
    }

    pub async fn reminder(
        &self,
        id: NotificationId,
    ) -> Result<Option<NotificationRequest>, EngineError> {
        Ok(self.ledger.get(id).await?)
    }

    pub fn request_exact_alarm_permission(&self) {
        self.prompter.request_exact_alarm_permission();
    }

    pub fn request_battery_optimization_exemption(&self) {
        self.prompter.request_battery_optimization_exemption();
    }

    /// Register the daily health check at the configured local time.
    pub async fn install_health_check(&self) -> Result<TriggerHandle, EngineError> {
        self.health
            .install_recurring(self.config.health_check_hour, self.config.health_check_minute)
            .await
    }

    /// Run recovery for a platform event.
    pub async fn handle_event(&self, event: RecoveryEvent) -> RecoveryOutcome {
        self.runner.run(event).await
    }

    /// Handle a fired trigger.
    ///
    /// Render triggers are shown; a delivered one-shot is then dropped from
    /// the ledger unless it was edited in the meantime. Health-check
    /// triggers run recovery.
    pub async fn handle_fire(&self, route: TriggerRoute, payload: &[u8]) -> FireOutcome {
        match route {
            TriggerRoute::Render => {
                let delivery = self.renderer.on_trigger(payload);
                if let Some(source) = &delivery.source
                    && !source.id.is_reserved()
                    && !source.is_recurring()
                {
                    self.forget_delivered(source).await;
                }
                FireOutcome::Rendered(delivery)
            }
            TriggerRoute::HealthCheck => {
                FireOutcome::Recovered(self.runner.run(RecoveryEvent::HealthCheck).await)
            }
        }
    }

    async fn forget_delivered(&self, delivered: &NotificationRequest) {
        match self.ledger.get(delivered.id).await {
            Ok(Some(current)) if current == *delivered => {
                if let Err(e) = self.ledger.remove(delivered.id).await {
                    warn!(id = %delivered.id, error = %e, "failed to drop delivered reminder");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(id = %delivered.id, error = %e, "ledger unavailable after delivery"),
        }
    }
}

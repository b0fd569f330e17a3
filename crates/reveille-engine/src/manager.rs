//! Alarm trigger manager.
//!
//! The only writer of platform triggers. Registration always replaces, so a
//! given id never has more than one live trigger no matter how often it is
//! scheduled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use reveille_store::{NotificationId, NotificationRequest};

use crate::codec;
use crate::platform::{
    AlarmService, Exactness, PlatformError, Repeat, TriggerHandle, TriggerRegistration,
    TriggerRoute,
};
use crate::EngineError;

/// Build the render trigger for `request` firing at `fire_at`.
pub fn registration_for(
    request: &NotificationRequest,
    fire_at: DateTime<Utc>,
    exactness: Exactness,
) -> TriggerRegistration {
    TriggerRegistration {
        id: request.id,
        fire_at,
        exactness,
        repeat: if request.is_recurring() {
            Repeat::Daily
        } else {
            Repeat::Never
        },
        route: TriggerRoute::Render,
        payload: codec::encode(request),
    }
}

/// Registers, replaces and cancels platform triggers.
pub struct AlarmTriggerManager {
    alarms: Arc<dyn AlarmService>,
    /// Per-id locks so operations on one id are linearized.
    locks: DashMap<NotificationId, Arc<Mutex<()>>>,
}

impl AlarmTriggerManager {
    /// Create a manager over the platform alarm service.
    pub fn new(alarms: Arc<dyn AlarmService>) -> Self {
        Self {
            alarms,
            locks: DashMap::new(),
        }
    }

    /// Whether the platform currently grants exact triggers.
    pub async fn has_permission_for_exact_triggers(&self) -> bool {
        self.alarms.exact_permission().await
    }

    /// The exactness a new registration should use right now.
    pub async fn preferred_exactness(&self) -> Exactness {
        if self.has_permission_for_exact_triggers().await {
            Exactness::Exact
        } else {
            Exactness::Inexact
        }
    }

    /// Schedule `request` at its own fire time, replacing any live trigger.
    ///
    /// A fire time in the past is not rejected; the platform fires it
    /// immediately.
    pub async fn schedule(
        &self,
        request: &NotificationRequest,
    ) -> Result<TriggerHandle, EngineError> {
        self.schedule_at(request, request.fire_at).await
    }

    /// Schedule `request` at an explicit fire time, replacing any live trigger.
    #[tracing::instrument(skip(self, request), fields(id = %request.id))]
    pub async fn schedule_at(
        &self,
        request: &NotificationRequest,
        fire_at: DateTime<Utc>,
    ) -> Result<TriggerHandle, EngineError> {
        let exactness = self.preferred_exactness().await;
        self.register(registration_for(request, fire_at, exactness))
            .await
    }

    /// Register a prepared trigger, replacing any live trigger with the same id.
    ///
    /// If the platform refuses an exact trigger, the registration is retried
    /// once as inexact. The returned handle reports the exactness that stuck.
    pub async fn register(
        &self,
        mut registration: TriggerRegistration,
    ) -> Result<TriggerHandle, EngineError> {
        let lock = self.lock_for(registration.id);
        let _guard = lock.lock().await;

        match self.alarms.register(registration.clone()).await {
            Ok(()) => {}
            Err(PlatformError::PermissionDenied)
                if registration.exactness == Exactness::Exact =>
            {
                warn!(
                    id = %registration.id,
                    "exact trigger refused, falling back to inexact"
                );
                registration.exactness = Exactness::Inexact;
                self.alarms.register(registration.clone()).await?;
            }
            Err(e) => return Err(e.into()),
        }

        debug!(
            id = %registration.id,
            fire_at = %registration.fire_at,
            exactness = ?registration.exactness,
            route = ?registration.route,
            "trigger registered"
        );
        Ok(registration.handle())
    }

    /// Cancel the trigger for `id`. Unknown ids are a no-op.
    ///
    /// The per-id lock is dropped afterwards unless another operation on
    /// `id` is holding or waiting on it.
    pub async fn cancel(&self, id: NotificationId) -> Result<(), EngineError> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.alarms.cancel(id).await
        };
        drop(lock);
        self.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);

        result?;
        info!(%id, "trigger cancelled");
        Ok(())
    }

    /// Every live trigger, as the platform reports it.
    pub async fn live_triggers(&self) -> Result<Vec<TriggerRegistration>, EngineError> {
        Ok(self.alarms.pending().await?)
    }

    fn lock_for(&self, id: NotificationId) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

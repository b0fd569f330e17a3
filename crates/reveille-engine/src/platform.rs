//! Capabilities the engine needs from the host platform.
//!
//! The alarm service, the notification surface and the permission screens are
//! ambient OS services. The engine only talks to them through these traits so
//! it can run against a real host or against [`InMemoryPlatform`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use reveille_store::NotificationId;

/// Whether the platform should wake the device at the precise time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exactness {
    /// Precise wake-up; may require a special permission.
    Exact,
    /// Battery-friendly; the platform may batch or defer it.
    Inexact,
}

/// Whether a trigger re-arms itself after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    Never,
    Daily,
}

/// Which entry point a fired trigger invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRoute {
    /// Show the notification carried in the payload.
    Render,
    /// Run schedule recovery.
    HealthCheck,
}

/// A wake trigger as held by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRegistration {
    pub id: NotificationId,
    pub fire_at: DateTime<Utc>,
    pub exactness: Exactness,
    pub repeat: Repeat,
    pub route: TriggerRoute,
    /// Opaque payload handed back when the trigger fires.
    pub payload: Vec<u8>,
}

impl TriggerRegistration {
    /// The handle callers get back after registering.
    pub fn handle(&self) -> TriggerHandle {
        TriggerHandle {
            id: self.id,
            fire_at: self.fire_at,
            exactness: self.exactness,
        }
    }

    /// Whether the trigger is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }

    /// The registration that remains after this trigger fires at `now`.
    ///
    /// One-shot triggers are consumed. Daily triggers advance to the same
    /// local wall-clock time on a later day, until they are in the future
    /// again. Days on which that time does not exist are skipped.
    pub fn after_fire(&self, now: DateTime<Utc>) -> Option<TriggerRegistration> {
        match self.repeat {
            Repeat::Never => None,
            Repeat::Daily => {
                let local = self.fire_at.with_timezone(&Local);
                let time = local.time();
                let mut date = local.date_naive();
                let mut fire_at = self.fire_at;
                while fire_at <= now {
                    date = date.succ_opt()?;
                    if let Some(at) = Local.from_local_datetime(&date.and_time(time)).earliest() {
                        fire_at = at.with_timezone(&Utc);
                    }
                }
                Some(TriggerRegistration {
                    fire_at,
                    ..self.clone()
                })
            }
        }
    }
}

/// Caller-side view of a registered trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerHandle {
    pub id: NotificationId,
    pub fire_at: DateTime<Utc>,
    pub exactness: Exactness,
}

/// What the notification surface is asked to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedNotification {
    /// Visible slot; rendering the same id again replaces the notification.
    pub id: NotificationId,
    pub title: String,
    pub body: String,
}

/// Errors reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// Exact triggers are not permitted.
    #[error("permission denied for exact triggers")]
    PermissionDenied,

    /// The service could not be reached.
    #[error("alarm service unavailable: {0}")]
    Unavailable(String),

    /// The service's backing store failed.
    #[error("alarm service I/O error: {0}")]
    Io(String),
}

/// The OS alarm/timer service.
///
/// Registrations survive process death but not reboot. Registering an id that
/// is already live replaces the previous registration.
#[async_trait]
pub trait AlarmService: Send + Sync {
    /// Register or replace the trigger for `trigger.id`.
    async fn register(&self, trigger: TriggerRegistration) -> Result<(), PlatformError>;

    /// Remove the trigger for `id`; unknown ids are ignored.
    async fn cancel(&self, id: NotificationId) -> Result<(), PlatformError>;

    /// Every live registration.
    async fn pending(&self) -> Result<Vec<TriggerRegistration>, PlatformError>;

    /// Whether exact triggers are currently permitted.
    async fn exact_permission(&self) -> bool;
}

/// The OS notification surface. Fire-and-forget.
pub trait NotificationSurface: Send + Sync {
    fn render(&self, notification: &RenderedNotification);
}

/// Redirections to the platform's permission screens. Fire-and-forget.
pub trait PermissionPrompter: Send + Sync {
    fn request_exact_alarm_permission(&self);
    fn request_battery_optimization_exemption(&self);
}

/// A complete in-process platform.
///
/// Behaves like the real services (replace-on-register, reboot wipes
/// triggers, exact triggers need permission) and exposes knobs for latency
/// and failures.
#[derive(Debug)]
pub struct InMemoryPlatform {
    triggers: Mutex<BTreeMap<NotificationId, TriggerRegistration>>,
    rendered: StdMutex<Vec<RenderedNotification>>,
    exact_permitted: AtomicBool,
    battery_exempt: AtomicBool,
    reject_exact: AtomicBool,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    register_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    permission_prompts: AtomicUsize,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new(true)
    }
}

impl InMemoryPlatform {
    /// Create a platform with the given exact-trigger permission.
    pub fn new(exact_permitted: bool) -> Self {
        Self {
            triggers: Mutex::new(BTreeMap::new()),
            rendered: StdMutex::new(Vec::new()),
            exact_permitted: AtomicBool::new(exact_permitted),
            battery_exempt: AtomicBool::new(false),
            reject_exact: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            register_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            permission_prompts: AtomicUsize::new(0),
        }
    }

    /// Grant or revoke exact-trigger permission.
    pub fn set_exact_permission(&self, permitted: bool) {
        self.exact_permitted.store(permitted, Ordering::SeqCst);
    }

    /// Reject exact registrations even while the permission query says yes,
    /// as happens when permission is revoked between query and register.
    pub fn set_reject_exact(&self, reject: bool) {
        self.reject_exact.store(reject, Ordering::SeqCst);
    }

    /// Make every alarm-service call fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay each register/cancel call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Drop every registration, as a device reboot does.
    pub async fn reboot(&self) {
        self.triggers.lock().await.clear();
    }

    /// Install a registration directly, bypassing the engine.
    pub async fn inject(&self, trigger: TriggerRegistration) {
        self.triggers.lock().await.insert(trigger.id, trigger);
    }

    /// Live registrations ordered by id.
    pub async fn snapshot(&self) -> Vec<TriggerRegistration> {
        self.triggers.lock().await.values().cloned().collect()
    }

    /// The live registration for `id`.
    pub async fn trigger(&self, id: NotificationId) -> Option<TriggerRegistration> {
        self.triggers.lock().await.get(&id).cloned()
    }

    /// Remove and return every trigger due at `now`, re-arming daily ones.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<TriggerRegistration> {
        let mut triggers = self.triggers.lock().await;
        let due: Vec<_> = triggers
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        for fired in &due {
            match fired.after_fire(now) {
                Some(next) => {
                    triggers.insert(next.id, next);
                }
                None => {
                    triggers.remove(&fired.id);
                }
            }
        }
        due
    }

    /// Everything rendered so far, in order.
    pub fn rendered(&self) -> Vec<RenderedNotification> {
        self.rendered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn permission_prompts(&self) -> usize {
        self.permission_prompts.load(Ordering::SeqCst)
    }

    pub fn battery_exempt(&self) -> bool {
        self.battery_exempt.load(Ordering::SeqCst)
    }

    async fn simulate_call(&self) -> Result<(), PlatformError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable("alarm service offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AlarmService for InMemoryPlatform {
    async fn register(&self, trigger: TriggerRegistration) -> Result<(), PlatformError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await?;
        if trigger.exactness == Exactness::Exact
            && (self.reject_exact.load(Ordering::SeqCst)
                || !self.exact_permitted.load(Ordering::SeqCst))
        {
            return Err(PlatformError::PermissionDenied);
        }
        self.triggers.lock().await.insert(trigger.id, trigger);
        Ok(())
    }

    async fn cancel(&self, id: NotificationId) -> Result<(), PlatformError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await?;
        self.triggers.lock().await.remove(&id);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<TriggerRegistration>, PlatformError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable("alarm service offline".to_string()));
        }
        Ok(self.snapshot().await)
    }

    async fn exact_permission(&self) -> bool {
        self.exact_permitted.load(Ordering::SeqCst)
    }
}

impl NotificationSurface for InMemoryPlatform {
    fn render(&self, notification: &RenderedNotification) {
        self.rendered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
    }
}

impl PermissionPrompter for InMemoryPlatform {
    fn request_exact_alarm_permission(&self) {
        self.permission_prompts.fetch_add(1, Ordering::SeqCst);
    }

    fn request_battery_optimization_exemption(&self) {
        self.permission_prompts.fetch_add(1, Ordering::SeqCst);
        self.battery_exempt.store(true, Ordering::SeqCst);
    }
}

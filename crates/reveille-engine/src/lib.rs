//! Notification scheduling and recovery engine for Reveille.
//!
//! This crate turns notification requests into platform wake triggers and
//! keeps them alive across process death and reboot:
//! - Encodes a self-contained payload into every trigger
//! - Registers exact triggers when permitted, inexact ones otherwise
//! - Renders fired triggers without any other component running
//! - Reconciles the ledger against live triggers under a hard deadline
//! - Installs a daily health check that repairs schedule drift

pub mod codec;
mod config;
mod engine;
mod error;
mod fallback;
mod health;
mod manager;
pub mod platform;
pub mod reconcile;
mod recovery;
mod renderer;

pub use codec::DecodeError;
pub use config::{EngineConfig, RenderDefaults};
pub use engine::{Engine, FireOutcome, PermissionSuggestion, ReminderReceipt};
pub use error::{EngineError, RecoveryError};
pub use fallback::FallbackAlarmIssuer;
pub use health::HealthCheckScheduler;
pub use manager::{AlarmTriggerManager, registration_for};
pub use platform::{
    AlarmService, Exactness, InMemoryPlatform, NotificationSurface, PermissionPrompter,
    PlatformError, RenderedNotification, Repeat, TriggerHandle, TriggerRegistration, TriggerRoute,
};
pub use reconcile::{ReconcileAction, ReconcilePlan, ReconcileReport};
pub use recovery::{RecoveryEvent, RecoveryOutcome, RecoveryPhase, RecoveryRunner};
pub use renderer::{Delivery, FireTimeRenderer};

pub use reveille_store::{NotificationId, NotificationRequest, Recurrence, ScheduleLedger};

//! Engine configuration.

use std::time::Duration;

/// Budget for recovery after boot or app replacement.
const DEFAULT_BOOT_DEADLINE_SECS: u64 = 5;

/// Budget for recovery invoked by the daily health check.
const DEFAULT_HEALTH_CHECK_DEADLINE_SECS: u64 = 7;

/// Budget for acquiring the runtime context before reconciliation starts.
const DEFAULT_START_TIMEOUT_SECS: u64 = 2;

/// How far ahead the safety-net fallback fires.
const DEFAULT_FALLBACK_MINUTES: u32 = 1;

/// Local time of the daily health check (03:00).
const DEFAULT_HEALTH_CHECK_HOUR: u32 = 3;
const DEFAULT_HEALTH_CHECK_MINUTE: u32 = 0;

/// One-shot reminders missed by less than this are still delivered.
const DEFAULT_MISSED_GRACE_SECS: u64 = 15 * 60;

/// Text used when a fired payload is unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderDefaults {
    pub title: String,
    pub body: String,
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Self {
            title: "Reminder".to_string(),
            body: "You have a new reminder.".to_string(),
        }
    }
}

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reconciliation budget after boot or app replacement.
    pub boot_deadline: Duration,
    /// Reconciliation budget for the health check and manual runs.
    pub health_check_deadline: Duration,
    /// Budget for loading the ledger and querying permissions.
    pub start_timeout: Duration,
    /// Minutes ahead of now that a fallback alarm fires.
    pub fallback_minutes: u32,
    /// Arm a fallback before recovering from boot or app replacement.
    pub fallback_on_boot: bool,
    /// Local hour of the daily health check.
    pub health_check_hour: u32,
    /// Local minute of the daily health check.
    pub health_check_minute: u32,
    /// Window in which missed one-shot reminders are still delivered.
    pub missed_grace: Duration,
    /// Text rendered for undecodable payloads.
    pub render: RenderDefaults,
    /// Title of the fallback alarm.
    pub fallback_title: String,
    /// Body of the fallback alarm.
    pub fallback_body: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            boot_deadline: Duration::from_secs(DEFAULT_BOOT_DEADLINE_SECS),
            health_check_deadline: Duration::from_secs(DEFAULT_HEALTH_CHECK_DEADLINE_SECS),
            start_timeout: Duration::from_secs(DEFAULT_START_TIMEOUT_SECS),
            fallback_minutes: DEFAULT_FALLBACK_MINUTES,
            fallback_on_boot: true,
            health_check_hour: DEFAULT_HEALTH_CHECK_HOUR,
            health_check_minute: DEFAULT_HEALTH_CHECK_MINUTE,
            missed_grace: Duration::from_secs(DEFAULT_MISSED_GRACE_SECS),
            render: RenderDefaults::default(),
            fallback_title: "Reminder (backup)".to_string(),
            fallback_body: "Open Reveille to check your upcoming reminders.".to_string(),
        }
    }
}

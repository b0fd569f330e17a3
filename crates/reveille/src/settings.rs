//! Host settings shared by every subcommand.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Args;
use miette::Result;

use reveille_engine::EngineConfig;

/// A local wall-clock time, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    pub hour: u32,
    pub minute: u32,
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hour, minute) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid time '{s}', expected HH:MM"))?;
        let hour: u32 = hour
            .trim()
            .parse()
            .map_err(|_| format!("invalid hour in '{s}'"))?;
        let minute: u32 = minute
            .trim()
            .parse()
            .map_err(|_| format!("invalid minute in '{s}'"))?;
        if hour > 23 || minute > 59 {
            return Err(format!("time '{s}' out of range"));
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Paths and engine tuning. Anything left unset keeps the engine default.
#[derive(Debug, Clone, Default, Args)]
pub struct Settings {
    /// Ledger file (default: <data dir>/reveille/ledger.json)
    #[arg(long, global = true, env = "REVEILLE_LEDGER")]
    pub ledger: Option<PathBuf>,

    /// Alarm spool file (default: <runtime dir>/reveille/alarms.json)
    #[arg(long, global = true, env = "REVEILLE_SPOOL")]
    pub spool: Option<PathBuf>,

    /// Local time of the daily health check, HH:MM
    #[arg(long, global = true, env = "REVEILLE_HEALTH_CHECK_AT")]
    pub health_check_at: Option<ClockTime>,

    /// Recovery budget after boot or upgrade, in seconds
    #[arg(long, global = true, env = "REVEILLE_BOOT_DEADLINE_SECS")]
    pub boot_deadline_secs: Option<u64>,

    /// Recovery budget for the health check, in seconds
    #[arg(long, global = true, env = "REVEILLE_HEALTH_CHECK_DEADLINE_SECS")]
    pub health_check_deadline_secs: Option<u64>,

    /// Minutes ahead that the safety-net reminder fires
    #[arg(long, global = true, env = "REVEILLE_FALLBACK_MINUTES")]
    pub fallback_minutes: Option<u32>,

    /// Missed one-shot reminders younger than this are still delivered, in minutes
    #[arg(long, global = true, env = "REVEILLE_MISSED_GRACE_MINUTES")]
    pub missed_grace_minutes: Option<u64>,
}

impl Settings {
    /// Engine configuration with these overrides applied.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::default();
        if let Some(at) = self.health_check_at {
            config.health_check_hour = at.hour;
            config.health_check_minute = at.minute;
        }
        if let Some(secs) = self.boot_deadline_secs {
            config.boot_deadline = Duration::from_secs(secs);
        }
        if let Some(secs) = self.health_check_deadline_secs {
            config.health_check_deadline = Duration::from_secs(secs);
        }
        if let Some(minutes) = self.fallback_minutes {
            config.fallback_minutes = minutes;
        }
        if let Some(minutes) = self.missed_grace_minutes {
            let secs = minutes.checked_mul(60).ok_or_else(|| {
                miette::miette!("missed grace of {minutes} minutes is out of range")
            })?;
            config.missed_grace = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

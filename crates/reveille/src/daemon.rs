//! Alarm daemon.
//!
//! Plays the platform's part at runtime: on start it works out whether the
//! machine rebooted or the build changed and runs recovery accordingly, then
//! delivers due triggers from the spool until interrupted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use reveille_engine::{Engine, FireOutcome, RecoveryEvent};

use crate::spool::SpoolAlarmService;

/// Build identity recorded in the spool.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default spool poll interval in milliseconds.
const DEFAULT_TICK_MILLIS: u64 = 1000;

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// How often the spool is checked for due triggers.
    pub tick: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(DEFAULT_TICK_MILLIS),
        }
    }
}

/// Which recovery, if any, a freshly started daemon owes.
///
/// A missing spool means a reboot wiped it. A spool stamped by another build
/// means the application was replaced.
pub fn lifecycle_event(
    spool_present: bool,
    recorded_version: Option<&str>,
    current_version: &str,
) -> Option<RecoveryEvent> {
    if !spool_present {
        return Some(RecoveryEvent::BootCompleted);
    }
    match recorded_version {
        Some(recorded) if recorded == current_version => None,
        _ => Some(RecoveryEvent::PackageReplaced),
    }
}

/// Detect boot or replacement, stamp the spool and recover.
///
/// A start with no lifecycle event still runs a manual recovery, so triggers
/// lost while no daemon was running are restored. Returns the detected event.
pub async fn start_up(engine: &Engine, spool: &SpoolAlarmService) -> Result<Option<RecoveryEvent>> {
    let present = spool.exists().await;
    let recorded = if present {
        spool
            .app_version()
            .await
            .map_err(|e| miette::miette!("{}", e))?
    } else {
        None
    };

    let event = lifecycle_event(present, recorded.as_deref(), APP_VERSION);
    spool
        .stamp_app_version(APP_VERSION)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let recovery = event.unwrap_or(RecoveryEvent::Manual);
    info!(detected = ?event, event = ?recovery, "recovering on start");
    let outcome = engine.handle_event(recovery).await;
    info!(phase = ?outcome.phase(), "startup recovery finished");
    Ok(event)
}

/// Deliver every trigger due now. Returns how many fired.
pub async fn deliver_due(engine: &Engine, spool: &SpoolAlarmService) -> usize {
    let fired = match spool.take_due(Utc::now()).await {
        Ok(fired) => fired,
        Err(e) => {
            warn!(error = %e, "failed to read alarm spool");
            return 0;
        }
    };

    for trigger in &fired {
        match engine.handle_fire(trigger.route, &trigger.payload).await {
            FireOutcome::Rendered(delivery) => {
                debug!(id = %delivery.notification.id, "trigger delivered");
            }
            FireOutcome::Recovered(outcome) => {
                info!(phase = ?outcome.phase(), "health check recovery finished");
            }
        }
    }
    fired.len()
}

/// Run the daemon until Ctrl-C.
pub async fn run(engine: Arc<Engine>, spool: Arc<SpoolAlarmService>, config: DaemonConfig) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    start_up(&engine, &spool).await?;
    info!(spool = %spool.path().display(), tick_ms = config.tick.as_millis() as u64, "daemon started");

    let mut interval = tokio::time::interval(config.tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = interval.tick() => {
                deliver_due(&engine, &spool).await;
            }
        }
    }

    info!("daemon stopped");
    Ok(())
}

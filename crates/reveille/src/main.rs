//! Reveille: reminders that survive restarts and reboots
//!
//! Main binary with subcommands:
//! - `add`, `cancel`, `clear`, `list`: manage reminders
//! - `backup`: arm a short-delay backup copy of one reminder
//! - `recover`: run schedule recovery by hand
//! - `fire`: render a raw trigger payload
//! - `permission`: inspect or flip the simulated platform permissions
//! - `daemon`: deliver due reminders until interrupted

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reveille_engine::{
    AlarmService, Engine, FireOutcome, NotificationId, NotificationRequest, NotificationSurface,
    PermissionPrompter, PermissionSuggestion, Recurrence, RecoveryEvent, RecoveryOutcome,
    ScheduleLedger, TriggerRoute,
};
use reveille_store::FileLedger;

mod daemon;
mod settings;
mod spool;
mod terminal;

use settings::{ClockTime, Settings};
use spool::SpoolAlarmService;
use terminal::{TerminalPrompter, TerminalSurface};

#[derive(Parser)]
#[command(name = "reveille")]
#[command(about = "Reminders that survive restarts and reboots", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a reminder
    Add {
        /// Reminder id (non-negative; reusing an id replaces the reminder)
        #[arg(long)]
        id: i32,

        /// Notification title
        #[arg(long)]
        title: String,

        /// Notification body
        #[arg(long, default_value = "")]
        body: String,

        #[command(flatten)]
        when: When,
    },

    /// Arm a one-shot backup that shows this text under a reminder's id
    Backup {
        /// Reminder id the backup belongs to
        #[arg(long)]
        id: i32,

        /// Notification title
        #[arg(long, default_value = "")]
        title: String,

        /// Notification body
        #[arg(long, default_value = "")]
        body: String,

        /// Seconds from now until the backup fires
        #[arg(long, default_value_t = 30)]
        in_seconds: u32,
    },

    /// Cancel a reminder
    Cancel {
        /// Reminder id
        id: i32,
    },

    /// Remove every reminder
    Clear,

    /// List reminders and the state of their triggers
    List,

    /// Run schedule recovery now
    Recover {
        /// Event to recover from
        #[arg(long, value_enum, default_value_t = EventArg::Manual)]
        event: EventArg,
    },

    /// Handle a raw trigger payload as if its trigger had fired
    Fire {
        /// File holding the payload bytes
        payload: PathBuf,

        /// Entry point the trigger invokes
        #[arg(long, value_enum, default_value_t = RouteArg::Render)]
        route: RouteArg,
    },

    /// Show or change simulated platform permissions
    Permission {
        #[arg(value_enum)]
        kind: PermissionKind,

        /// Grant the permission
        #[arg(long, conflicts_with = "revoke")]
        grant: bool,

        /// Revoke the permission
        #[arg(long)]
        revoke: bool,
    },

    /// Deliver due reminders until interrupted
    Daemon {
        /// Spool poll interval in milliseconds
        #[arg(long, env = "REVEILLE_TICK_MS")]
        tick_ms: Option<u64>,
    },
}

/// When a new reminder fires. Exactly one must be given.
#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct When {
    /// Fire once at this instant (RFC 3339)
    #[arg(long)]
    at: Option<DateTime<Utc>>,

    /// Fire once, this many minutes from now
    #[arg(long)]
    in_minutes: Option<i64>,

    /// Fire every day at this local time, HH:MM
    #[arg(long)]
    daily: Option<ClockTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EventArg {
    Boot,
    Replaced,
    HealthCheck,
    Manual,
}

impl From<EventArg> for RecoveryEvent {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::Boot => RecoveryEvent::BootCompleted,
            EventArg::Replaced => RecoveryEvent::PackageReplaced,
            EventArg::HealthCheck => RecoveryEvent::HealthCheck,
            EventArg::Manual => RecoveryEvent::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RouteArg {
    Render,
    HealthCheck,
}

impl From<RouteArg> for TriggerRoute {
    fn from(arg: RouteArg) -> Self {
        match arg {
            RouteArg::Render => TriggerRoute::Render,
            RouteArg::HealthCheck => TriggerRoute::HealthCheck,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PermissionKind {
    /// Exact alarms
    Exact,
    /// Battery optimization exemption
    Battery,
}

/// The engine wired to the file-backed host services.
struct Host {
    engine: Arc<Engine>,
    spool: Arc<SpoolAlarmService>,
}

impl Host {
    fn open(settings: &Settings) -> Result<Self> {
        let config = settings.engine_config()?;
        let ledger = Arc::new(FileLedger::open(settings.ledger.clone()));
        let spool = Arc::new(SpoolAlarmService::open(settings.spool.clone()));
        let engine = Arc::new(Engine::new(
            config,
            ledger as Arc<dyn ScheduleLedger>,
            Arc::clone(&spool) as Arc<dyn AlarmService>,
            Arc::new(TerminalSurface) as Arc<dyn NotificationSurface>,
            Arc::new(TerminalPrompter) as Arc<dyn PermissionPrompter>,
        ));
        Ok(Self { engine, spool })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "reveille=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let host = Host::open(&cli.settings)?;

    match cli.command {
        Commands::Add {
            id,
            title,
            body,
            when,
        } => run_add(&host, id, title, body, when).await,

        Commands::Backup {
            id,
            title,
            body,
            in_seconds,
        } => {
            let id = NotificationId::user(id).map_err(|e| miette::miette!("{}", e))?;
            let handle = host
                .engine
                .schedule_backup_reminder(id, &title, &body, in_seconds)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!(
                "Backup for reminder {id} armed for {} ({:?})",
                handle.fire_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                handle.exactness,
            );
            Ok(())
        }

        Commands::Cancel { id } => {
            let id = NotificationId::user(id).map_err(|e| miette::miette!("{}", e))?;
            let existed = host
                .engine
                .cancel_reminder(id)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            if existed {
                println!("Cancelled reminder {id}");
            } else {
                println!("No reminder {id}");
            }
            Ok(())
        }

        Commands::Clear => {
            let ids = host
                .engine
                .clear_all()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("Removed {} reminder(s)", ids.len());
            Ok(())
        }

        Commands::List => run_list(&host).await,

        Commands::Recover { event } => {
            let outcome = host.engine.handle_event(event.into()).await;
            print_outcome(&outcome);
            match outcome {
                RecoveryOutcome::Failed(e) => Err(miette::miette!("{}", e)),
                _ => Ok(()),
            }
        }

        Commands::Fire { payload, route } => {
            let bytes = tokio::fs::read(&payload)
                .await
                .map_err(|e| miette::miette!("failed to read {}: {}", payload.display(), e))?;
            match host.engine.handle_fire(route.into(), &bytes).await {
                FireOutcome::Rendered(delivery) => {
                    if delivery.source.is_none() {
                        println!("(payload could not be decoded; showed the default text)");
                    }
                }
                FireOutcome::Recovered(outcome) => print_outcome(&outcome),
            }
            Ok(())
        }

        Commands::Permission {
            kind,
            grant,
            revoke,
        } => run_permission(&host, kind, grant, revoke).await,

        Commands::Daemon { tick_ms } => {
            let mut config = daemon::DaemonConfig::default();
            if let Some(ms) = tick_ms {
                config.tick = Duration::from_millis(ms.max(1));
            }
            daemon::run(host.engine, host.spool, config).await
        }
    }
}

async fn run_add(host: &Host, id: i32, title: String, body: String, when: When) -> Result<()> {
    let id = NotificationId::user(id).map_err(|e| miette::miette!("{}", e))?;
    let now = Utc::now();

    let request = if let Some(at) = when.at {
        NotificationRequest::once(id, title, body, at)
    } else if let Some(minutes) = when.in_minutes {
        NotificationRequest::once(id, title, body, minutes_from(now, minutes)?)
    } else if let Some(daily) = when.daily {
        NotificationRequest::daily(id, title, body, daily.hour, daily.minute, now)
            .map_err(|e| miette::miette!("{}", e))?
    } else {
        return Err(miette::miette!("one of --at, --in-minutes or --daily is required"));
    };

    let receipt = host
        .engine
        .create_or_update_reminder(request)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    println!(
        "Scheduled reminder {} for {} ({:?})",
        receipt.handle.id,
        receipt.handle.fire_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        receipt.handle.exactness,
    );
    if receipt.suggestion == Some(PermissionSuggestion::GrantExactAlarms) {
        host.engine.request_exact_alarm_permission();
    }
    Ok(())
}

/// `now` shifted by `minutes`, or an error if that leaves the calendar.
fn minutes_from(now: DateTime<Utc>, minutes: i64) -> Result<DateTime<Utc>> {
    chrono::Duration::try_minutes(minutes)
        .and_then(|offset| now.checked_add_signed(offset))
        .ok_or_else(|| miette::miette!("{minutes} minutes from now is out of range"))
}

async fn run_list(host: &Host) -> Result<()> {
    let reminders = host
        .engine
        .reminders()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let live = host
        .engine
        .manager()
        .live_triggers()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    if reminders.is_empty() {
        println!("No reminders.");
    }
    for reminder in &reminders {
        let schedule = match reminder.recurrence {
            Recurrence::None => reminder
                .fire_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
            Recurrence::DailyAt { hour, minute } => format!("daily {hour:02}:{minute:02}"),
        };
        let state = match live.iter().find(|t| t.id == reminder.id) {
            Some(trigger) => format!(
                "{:?}, next {}",
                trigger.exactness,
                trigger.fire_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
            ),
            None => "no live trigger (run `reveille recover`)".to_string(),
        };
        println!("{:>6}  {:<30}  {:<16}  {}", reminder.id, reminder.title, schedule, state);
    }

    for trigger in live.iter().filter(|t| t.id.is_reserved()) {
        let name = if trigger.id == NotificationId::HEALTH_CHECK {
            "health check".to_string()
        } else if let Some(owner) = trigger.id.backup_owner() {
            format!("backup for {owner}")
        } else {
            "fallback".to_string()
        };
        println!(
            "{:>6}  {:<30}  {}",
            trigger.id,
            name,
            trigger.fire_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn run_permission(host: &Host, kind: PermissionKind, grant: bool, revoke: bool) -> Result<()> {
    if !grant && !revoke {
        match kind {
            PermissionKind::Exact => {
                let granted = host.engine.manager().has_permission_for_exact_triggers().await;
                println!("Exact alarms: {}", if granted { "granted" } else { "not granted" });
                if !granted {
                    host.engine.request_exact_alarm_permission();
                }
            }
            PermissionKind::Battery => {
                let exempt = host
                    .spool
                    .battery_exempt()
                    .await
                    .map_err(|e| miette::miette!("{}", e))?;
                println!("Battery exemption: {}", if exempt { "granted" } else { "not granted" });
                if !exempt {
                    host.engine.request_battery_optimization_exemption();
                }
            }
        }
        return Ok(());
    }

    match kind {
        PermissionKind::Exact => {
            host.spool
                .set_exact_permission(grant)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            // Re-register existing triggers with the new exactness
            let outcome = host.engine.handle_event(RecoveryEvent::Manual).await;
            print_outcome(&outcome);
        }
        PermissionKind::Battery => {
            host.spool
                .set_battery_exempt(grant)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
        }
    }
    println!(
        "{:?} permission {}",
        kind,
        if grant { "granted" } else { "revoked" }
    );
    Ok(())
}

fn print_outcome(outcome: &RecoveryOutcome) {
    match outcome {
        RecoveryOutcome::Completed(report) => println!(
            "Recovery completed: {} registered, {} cancelled, {} expired, {} unchanged, {} failed",
            report.registered, report.cancelled, report.expired, report.unchanged, report.failed
        ),
        RecoveryOutcome::TimedOut(report) => println!(
            "Recovery timed out after {} of {} actions; a backup reminder was armed",
            report.attempted(),
            report.planned
        ),
        RecoveryOutcome::Failed(e) => println!("Recovery failed: {e}"),
        RecoveryOutcome::Coalesced => println!("Recovery already running"),
    }
}

//! Recovery runner.
//!
//! Rebuilds live triggers from the ledger after anything that may have wiped
//! or skewed them. Every run has a hard deadline; when it is hit the worker
//! is aborted and whatever prefix of the plan was applied stays applied.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use reveille_store::{NotificationRequest, ScheduleLedger};

use crate::config::EngineConfig;
use crate::fallback::FallbackAlarmIssuer;
use crate::manager::AlarmTriggerManager;
use crate::platform::{Exactness, TriggerHandle};
use crate::reconcile::{self, PlanContext, ReconcileAction, ReconcileReport};
use crate::{EngineError, RecoveryError};

/// What caused a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryEvent {
    /// The device finished booting; every trigger is gone.
    BootCompleted,
    /// The application was reinstalled or updated; triggers may be gone.
    PackageReplaced,
    /// The daily health-check trigger fired.
    HealthCheck,
    /// Requested explicitly.
    Manual,
}

impl RecoveryEvent {
    /// Budget for the reconciliation phase.
    pub fn deadline(self, config: &EngineConfig) -> Duration {
        match self {
            Self::BootCompleted | Self::PackageReplaced => config.boot_deadline,
            Self::HealthCheck | Self::Manual => config.health_check_deadline,
        }
    }

    /// Whether a fallback is armed before the run starts.
    ///
    /// Only boot-like events, where the primary path is least likely to
    /// finish, pay for one up front.
    pub fn arms_fallback_first(self, config: &EngineConfig) -> bool {
        config.fallback_on_boot && matches!(self, Self::BootCompleted | Self::PackageReplaced)
    }
}

/// Where the runner is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Idle,
    Starting,
    Running,
    Completed,
    TimedOut,
    Failed,
}

/// How a call to [`RecoveryRunner::run`] ended.
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// Every planned action was attempted.
    Completed(ReconcileReport),
    /// The deadline hit first. The report covers the applied prefix.
    TimedOut(ReconcileReport),
    /// The run could not start or the worker died.
    Failed(RecoveryError),
    /// Another run was already in progress; this one did nothing.
    Coalesced,
}

impl RecoveryOutcome {
    /// The terminal phase for this outcome. Coalesced runs never left idle.
    pub fn phase(&self) -> RecoveryPhase {
        match self {
            Self::Completed(_) => RecoveryPhase::Completed,
            Self::TimedOut(_) => RecoveryPhase::TimedOut,
            Self::Failed(_) => RecoveryPhase::Failed,
            Self::Coalesced => RecoveryPhase::Idle,
        }
    }

    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            Self::Completed(report) | Self::TimedOut(report) => Some(report),
            _ => None,
        }
    }
}

/// Everything reconciliation needs, acquired before it starts.
struct RuntimeContext {
    desired: Vec<NotificationRequest>,
    exactness: Exactness,
}

/// Counters shared with the worker so an aborted run can still report.
#[derive(Debug, Default)]
struct Progress {
    planned: AtomicUsize,
    unchanged: AtomicUsize,
    registered: AtomicUsize,
    cancelled: AtomicUsize,
    expired: AtomicUsize,
    failed: AtomicUsize,
}

impl Progress {
    fn record(&self, action: &ReconcileAction) {
        let counter = match action {
            ReconcileAction::CancelOrphan(_) => &self.cancelled,
            ReconcileAction::Expire(_) => &self.expired,
            ReconcileAction::Register(_) => &self.registered,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn report(&self) -> ReconcileReport {
        ReconcileReport {
            planned: self.planned.load(Ordering::SeqCst),
            registered: self.registered.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            expired: self.expired.load(Ordering::SeqCst),
            unchanged: self.unchanged.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Resets the published phase to idle when a run ends, however it ends.
struct IdleOnDrop<'a>(&'a watch::Sender<RecoveryPhase>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(RecoveryPhase::Idle);
    }
}

/// Runs recovery, at most one run at a time.
pub struct RecoveryRunner {
    manager: Arc<AlarmTriggerManager>,
    fallback: Arc<FallbackAlarmIssuer>,
    ledger: Arc<dyn ScheduleLedger>,
    config: EngineConfig,
    gate: Mutex<()>,
    phase: watch::Sender<RecoveryPhase>,
}

impl RecoveryRunner {
    pub fn new(
        manager: Arc<AlarmTriggerManager>,
        fallback: Arc<FallbackAlarmIssuer>,
        ledger: Arc<dyn ScheduleLedger>,
        config: EngineConfig,
    ) -> Self {
        let (phase, _) = watch::channel(RecoveryPhase::Idle);
        Self {
            manager,
            fallback,
            ledger,
            config,
            gate: Mutex::new(()),
            phase,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> RecoveryPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<RecoveryPhase> {
        self.phase.subscribe()
    }

    /// Run recovery for `event`.
    ///
    /// Returns [`RecoveryOutcome::Coalesced`] without doing anything if a run
    /// is already active; that run reads the ledger itself, so its result
    /// covers this request too.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, event: RecoveryEvent) -> RecoveryOutcome {
        let Ok(_active) = self.gate.try_lock() else {
            info!("recovery already running, coalescing");
            return RecoveryOutcome::Coalesced;
        };
        let _reset = IdleOnDrop(&self.phase);

        let started = Utc::now();
        let outcome = self.drive(event).await;
        self.phase.send_replace(outcome.phase());

        let elapsed_ms = (Utc::now() - started).num_milliseconds();
        match &outcome {
            RecoveryOutcome::Completed(report) => info!(
                elapsed_ms,
                registered = report.registered,
                cancelled = report.cancelled,
                expired = report.expired,
                unchanged = report.unchanged,
                failed = report.failed,
                "recovery completed"
            ),
            RecoveryOutcome::TimedOut(report) => warn!(
                elapsed_ms,
                attempted = report.attempted(),
                planned = report.planned,
                "recovery timed out"
            ),
            RecoveryOutcome::Failed(e) => error!(elapsed_ms, error = %e, "recovery failed"),
            RecoveryOutcome::Coalesced => {}
        }
        outcome
    }

    async fn drive(&self, event: RecoveryEvent) -> RecoveryOutcome {
        self.phase.send_replace(RecoveryPhase::Starting);

        let mut fallback = None;
        if event.arms_fallback_first(&self.config) {
            fallback = self.arm_fallback().await;
        }

        let context =
            match tokio::time::timeout(self.config.start_timeout, self.acquire_context()).await {
                Ok(Ok(context)) => context,
                Ok(Err(e)) => {
                    return RecoveryOutcome::Failed(RecoveryError::ColdStart(e.to_string()));
                }
                Err(_) => {
                    return RecoveryOutcome::Failed(RecoveryError::ColdStart(format!(
                        "runtime context not ready within {:?}",
                        self.config.start_timeout
                    )));
                }
            };

        self.phase.send_replace(RecoveryPhase::Running);
        let deadline = event.deadline(&self.config);
        let progress = Arc::new(Progress::default());
        let mut worker = tokio::spawn(reconcile_all(
            Arc::clone(&self.manager),
            Arc::clone(&self.ledger),
            context,
            self.plan_settings(),
            Arc::clone(&progress),
        ));

        tokio::select! {
            joined = &mut worker => match joined {
                Ok(Ok(())) => {
                    if let Some(handle) = fallback
                        && let Err(e) = self.fallback.retract(&handle).await
                    {
                        warn!(error = %e, "failed to retract fallback alarm");
                    }
                    RecoveryOutcome::Completed(progress.report())
                }
                Ok(Err(e)) => RecoveryOutcome::Failed(RecoveryError::Reconcile(e)),
                Err(e) => RecoveryOutcome::Failed(RecoveryError::Worker(e.to_string())),
            },
            _ = tokio::time::sleep(deadline) => {
                worker.abort();
                // Wait for the abort to land so nothing is applied after we return
                let _ = worker.await;
                warn!(error = %RecoveryError::Timeout(deadline), "aborting reconciliation");

                if fallback.is_none() {
                    self.arm_fallback().await;
                }
                RecoveryOutcome::TimedOut(progress.report())
            }
        }
    }

    async fn acquire_context(&self) -> Result<RuntimeContext, EngineError> {
        let desired = self.ledger.load().await?;
        let exactness = self.manager.preferred_exactness().await;
        debug!(entries = desired.len(), ?exactness, "runtime context acquired");
        Ok(RuntimeContext { desired, exactness })
    }

    async fn arm_fallback(&self) -> Option<TriggerHandle> {
        match self
            .fallback
            .issue_short_horizon_fallback(self.config.fallback_minutes)
            .await
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to arm fallback alarm");
                None
            }
        }
    }

    fn plan_settings(&self) -> PlanSettings {
        PlanSettings {
            missed_grace: chrono::Duration::from_std(self.config.missed_grace)
                .unwrap_or(chrono::Duration::MAX),
            health_check: (
                self.config.health_check_hour,
                self.config.health_check_minute,
            ),
        }
    }
}

/// The clock-independent part of a [`PlanContext`].
#[derive(Debug, Clone, Copy)]
struct PlanSettings {
    missed_grace: chrono::Duration,
    health_check: (u32, u32),
}

/// Plan against the live trigger set and apply every action in order.
///
/// A failing action is logged and counted; the rest still run.
async fn reconcile_all(
    manager: Arc<AlarmTriggerManager>,
    ledger: Arc<dyn ScheduleLedger>,
    context: RuntimeContext,
    settings: PlanSettings,
    progress: Arc<Progress>,
) -> Result<(), EngineError> {
    let live = manager.live_triggers().await?;
    let plan = reconcile::plan(
        &context.desired,
        &live,
        &PlanContext {
            now: Utc::now(),
            exactness: context.exactness,
            missed_grace: settings.missed_grace,
            health_check: Some(settings.health_check),
        },
    );
    progress.planned.store(plan.actions.len(), Ordering::SeqCst);
    progress.unchanged.store(plan.unchanged, Ordering::SeqCst);

    for action in &plan.actions {
        match reconcile::apply(action, &manager, ledger.as_ref()).await {
            Ok(()) => progress.record(action),
            Err(e) => {
                progress.failed.fetch_add(1, Ordering::SeqCst);
                warn!(id = %action.id(), error = %e, "reconcile action failed");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{AlarmService, InMemoryPlatform, TriggerRoute};
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use reveille_store::{MemoryLedger, NotificationId};

    struct Harness {
        platform: Arc<InMemoryPlatform>,
        ledger: Arc<MemoryLedger>,
        runner: Arc<RecoveryRunner>,
    }

    fn harness(config: EngineConfig, entries: Vec<NotificationRequest>) -> Harness {
        let platform = Arc::new(InMemoryPlatform::new(true));
        let ledger = Arc::new(MemoryLedger::with_entries(entries));
        let manager = Arc::new(AlarmTriggerManager::new(
            Arc::clone(&platform) as Arc<dyn AlarmService>
        ));
        let fallback = Arc::new(FallbackAlarmIssuer::new(
            Arc::clone(&manager),
            config.fallback_title.clone(),
            config.fallback_body.clone(),
        ));
        let runner = Arc::new(RecoveryRunner::new(
            manager,
            fallback,
            Arc::clone(&ledger) as Arc<dyn ScheduleLedger>,
            config,
        ));
        Harness {
            platform,
            ledger,
            runner,
        }
    }

    fn upcoming(id: i32, hours: i64) -> NotificationRequest {
        NotificationRequest::once(
            NotificationId::new(id),
            format!("Reminder {id}"),
            "body",
            Utc::now() + ChronoDuration::hours(hours),
        )
    }

    async fn user_ids(platform: &InMemoryPlatform) -> Vec<i32> {
        platform
            .snapshot()
            .await
            .iter()
            .map(|t| t.id)
            .filter(|id| !id.is_reserved())
            .map(NotificationId::get)
            .collect()
    }

    #[tokio::test]
    async fn test_boot_restores_ledger_and_retracts_fallback() {
        let h = harness(EngineConfig::default(), vec![upcoming(1, 1), upcoming(2, 2)]);

        let outcome = h.runner.run(RecoveryEvent::BootCompleted).await;
        let RecoveryOutcome::Completed(report) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(report.registered, 3);
        assert_eq!(report.failed, 0);

        let live = h.platform.snapshot().await;
        let ids: Vec<_> = live.iter().map(|t| t.id).collect();
        assert_eq!(
            ids,
            vec![
                NotificationId::HEALTH_CHECK,
                NotificationId::new(1),
                NotificationId::new(2)
            ]
        );
        assert!(live.iter().all(|t| !t.id.is_fallback()));
        assert_eq!(h.runner.phase(), RecoveryPhase::Idle);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let h = harness(EngineConfig::default(), vec![upcoming(1, 1), upcoming(2, 2)]);
        h.runner.run(RecoveryEvent::Manual).await;
        let registers = h.platform.register_calls();

        let outcome = h.runner.run(RecoveryEvent::Manual).await;
        let report = outcome.report().copied().unwrap();
        assert_eq!(report.planned, 0);
        assert_eq!(report.unchanged, 2);
        assert_eq!(h.platform.register_calls(), registers);
    }

    #[tokio::test]
    async fn test_orphans_removed_and_expired_pruned() {
        let stale = NotificationRequest::once(
            NotificationId::new(7),
            "stale",
            "body",
            Utc::now() - ChronoDuration::hours(3),
        );
        let h = harness(EngineConfig::default(), vec![upcoming(1, 1), stale]);
        h.platform
            .inject(crate::manager::registration_for(
                &upcoming(42, 1),
                Utc::now() + ChronoDuration::hours(1),
                Exactness::Exact,
            ))
            .await;

        let outcome = h.runner.run(RecoveryEvent::Manual).await;
        let report = outcome.report().copied().unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.expired, 1);

        assert_eq!(user_ids(&h.platform).await, vec![1]);
        assert!(h.ledger.get(NotificationId::new(7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cold_start_failure_reports_and_resets() {
        let h = harness(EngineConfig::default(), vec![upcoming(1, 1)]);
        h.ledger.set_unavailable(true);

        let outcome = h.runner.run(RecoveryEvent::BootCompleted).await;
        assert!(matches!(
            outcome,
            RecoveryOutcome::Failed(RecoveryError::ColdStart(_))
        ));
        assert_eq!(h.runner.phase(), RecoveryPhase::Idle);

        // The boot fallback stays armed
        let live = h.platform.snapshot().await;
        assert_eq!(live.len(), 1);
        assert!(live[0].id.is_fallback());
        assert_eq!(live[0].route, TriggerRoute::Render);
    }

    #[tokio::test]
    async fn test_unavailable_platform_fails_run() {
        let h = harness(EngineConfig::default(), vec![upcoming(1, 1)]);
        h.platform.set_unavailable(true);

        let outcome = h.runner.run(RecoveryEvent::Manual).await;
        assert!(matches!(
            outcome,
            RecoveryOutcome::Failed(RecoveryError::Reconcile(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_leaves_applied_prefix() {
        let config = EngineConfig {
            health_check_deadline: Duration::from_millis(250),
            ..EngineConfig::default()
        };
        let h = harness(config, vec![upcoming(1, 1), upcoming(2, 2), upcoming(3, 3)]);
        h.platform.set_latency(Duration::from_millis(100));

        let outcome = h.runner.run(RecoveryEvent::HealthCheck).await;
        let RecoveryOutcome::TimedOut(report) = outcome else {
            panic!("expected timeout, got {outcome:?}");
        };
        assert_eq!(report.planned, 4);
        assert_eq!(report.registered, 2);
        assert_eq!(user_ids(&h.platform).await, vec![1, 2]);

        // A timed-out health check leaves a fallback behind
        let live = h.platform.snapshot().await;
        assert!(live.iter().any(|t| t.id.is_fallback()));
        assert!(live.iter().all(|t| t.id != NotificationId::HEALTH_CHECK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_coalesce() {
        let h = harness(EngineConfig::default(), vec![upcoming(1, 1)]);
        h.platform.set_latency(Duration::from_millis(50));

        let first = {
            let runner = Arc::clone(&h.runner);
            tokio::spawn(async move { runner.run(RecoveryEvent::Manual).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.runner.phase(), RecoveryPhase::Running);

        let second = h.runner.run(RecoveryEvent::HealthCheck).await;
        assert!(matches!(second, RecoveryOutcome::Coalesced));

        let first = first.await.unwrap();
        assert!(matches!(first, RecoveryOutcome::Completed(_)));
        assert_eq!(user_ids(&h.platform).await, vec![1]);
    }

    #[tokio::test]
    async fn test_lost_permission_downgrades_on_recovery() {
        let h = harness(EngineConfig::default(), vec![upcoming(1, 1)]);
        h.runner.run(RecoveryEvent::Manual).await;
        assert_eq!(
            h.platform.trigger(NotificationId::new(1)).await.unwrap().exactness,
            Exactness::Exact
        );

        h.platform.set_exact_permission(false);
        h.runner.run(RecoveryEvent::Manual).await;
        assert_eq!(
            h.platform.trigger(NotificationId::new(1)).await.unwrap().exactness,
            Exactness::Inexact
        );
    }

    #[tokio::test]
    async fn test_phase_transitions_are_published() {
        let h = harness(EngineConfig::default(), vec![upcoming(1, 1)]);
        let mut rx = h.runner.subscribe();
        let seen = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let phase = *rx.borrow_and_update();
                seen.push(phase);
                if phase == RecoveryPhase::Idle {
                    break;
                }
            }
            seen
        });

        h.runner.run(RecoveryEvent::Manual).await;
        let seen = seen.await.unwrap();
        assert_eq!(seen.last(), Some(&RecoveryPhase::Idle));
        assert!(
            !seen
                .iter()
                .any(|p| matches!(p, RecoveryPhase::Failed | RecoveryPhase::TimedOut))
        );
    }
}

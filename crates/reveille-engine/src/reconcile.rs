//! Reconciliation of the ledger against live triggers.
//!
//! Planning is a pure function of (ledger, live triggers, clock, permission);
//! applying the plan issues one platform call per action. Every action is
//! either a replace-registration or a removal, so any prefix of a plan leaves
//! processed ids correct and unprocessed ids untouched, and planning again
//! after a full apply yields nothing to do.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Local, Utc};
use tracing::debug;

use reveille_store::{NotificationId, NotificationRequest, Recurrence, ScheduleLedger};

use crate::health;
use crate::manager::{AlarmTriggerManager, registration_for};
use crate::platform::{Exactness, Repeat, TriggerRegistration};
use crate::EngineError;

/// One corrective operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Remove a trigger that has no ledger entry.
    CancelOrphan(NotificationId),
    /// Drop a one-shot missed beyond the grace window, and any trigger for it.
    Expire(NotificationId),
    /// Register or replace a trigger.
    Register(TriggerRegistration),
}

impl ReconcileAction {
    /// The id the action touches.
    pub fn id(&self) -> NotificationId {
        match self {
            Self::CancelOrphan(id) | Self::Expire(id) => *id,
            Self::Register(registration) => registration.id,
        }
    }
}

/// Inputs besides the two state snapshots.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext {
    pub now: DateTime<Utc>,
    /// Exactness new registrations should get.
    pub exactness: Exactness,
    /// One-shots missed by at most this much are still delivered.
    pub missed_grace: Duration,
    /// Local time of the daily health check, if it should be kept armed.
    pub health_check: Option<(u32, u32)>,
}

/// Ordered corrective actions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub actions: Vec<ReconcileAction>,
    /// Ledger entries whose trigger is already correct.
    pub unchanged: usize,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Counters for a (possibly partial) reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub planned: usize,
    pub registered: usize,
    pub cancelled: usize,
    pub expired: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl ReconcileReport {
    /// Actions attempted so far, successful or not.
    pub fn attempted(&self) -> usize {
        self.registered + self.cancelled + self.expired + self.failed
    }
}

/// Compute the actions that bring `live` in line with `desired`.
///
/// Orphan cancellations come first, then expiries, then registrations in id
/// order, then the health check.
pub fn plan(
    desired: &[NotificationRequest],
    live: &[TriggerRegistration],
    ctx: &PlanContext,
) -> ReconcilePlan {
    let live_by_id: HashMap<NotificationId, &TriggerRegistration> =
        live.iter().map(|t| (t.id, t)).collect();
    let wanted_ids: BTreeSet<NotificationId> = desired
        .iter()
        .filter(|r| !r.id.is_reserved())
        .map(|r| r.id)
        .collect();

    let mut orphans: Vec<NotificationId> = live
        .iter()
        .map(|t| t.id)
        .filter(|id| {
            if id.is_reserved() {
                *id != NotificationId::HEALTH_CHECK && !id.is_fallback() && !id.is_backup()
            } else {
                !wanted_ids.contains(id)
            }
        })
        .collect();
    orphans.sort();

    let mut expired = Vec::new();
    let mut registrations = Vec::new();
    let mut unchanged = 0;

    for request in desired.iter().filter(|r| !r.id.is_reserved()) {
        let Some(fire_at) = target_fire_time(request, ctx) else {
            expired.push(request.id);
            continue;
        };

        let want = registration_for(request, fire_at, ctx.exactness);
        match live_by_id.get(&request.id) {
            Some(current) if satisfies(current, &want, ctx) => unchanged += 1,
            _ => registrations.push(want),
        }
    }
    expired.sort();
    registrations.sort_by_key(|r| r.id);

    let mut actions: Vec<ReconcileAction> = orphans
        .into_iter()
        .map(ReconcileAction::CancelOrphan)
        .chain(expired.into_iter().map(ReconcileAction::Expire))
        .chain(registrations.into_iter().map(ReconcileAction::Register))
        .collect();

    if let Some((hour, minute)) = ctx.health_check
        && let Ok(want) = health::desired_registration(ctx.now, hour, minute)
    {
        let armed = live_by_id
            .get(&NotificationId::HEALTH_CHECK)
            .is_some_and(|t| satisfies(t, &want, ctx));
        if !armed {
            actions.push(ReconcileAction::Register(want));
        }
    }

    debug!(actions = actions.len(), unchanged, "reconciliation planned");
    ReconcilePlan { actions, unchanged }
}

/// When the trigger for `request` should fire, or `None` if it has expired.
fn target_fire_time(request: &NotificationRequest, ctx: &PlanContext) -> Option<DateTime<Utc>> {
    match request.recurrence {
        Recurrence::None => {
            (request.fire_at > ctx.now || ctx.now - request.fire_at <= ctx.missed_grace)
                .then_some(request.fire_at)
        }
        Recurrence::DailyAt { .. } => request.next_fire_after(&ctx.now.with_timezone(&Local)),
    }
}

/// Whether a live trigger already does what `want` describes.
///
/// A daily trigger must sit on the next occurrence, or on the previous one
/// while that is still due within the grace window and has not fired yet.
fn satisfies(
    current: &TriggerRegistration,
    want: &TriggerRegistration,
    ctx: &PlanContext,
) -> bool {
    let same_shape = current.route == want.route
        && current.repeat == want.repeat
        && current.exactness == want.exactness
        && current.payload == want.payload;
    let same_time = match want.repeat {
        Repeat::Never => current.fire_at == want.fire_at,
        Repeat::Daily => {
            current.fire_at == want.fire_at
                || (current.fire_at <= ctx.now
                    && ctx.now - current.fire_at <= ctx.missed_grace
                    && same_wall_clock(current.fire_at, want.fire_at))
        }
    };
    same_shape && same_time
}

fn same_wall_clock(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.with_timezone(&Local).time() == b.with_timezone(&Local).time()
}

/// Apply a single action.
pub async fn apply(
    action: &ReconcileAction,
    manager: &AlarmTriggerManager,
    ledger: &dyn ScheduleLedger,
) -> Result<(), EngineError> {
    match action {
        ReconcileAction::CancelOrphan(id) => manager.cancel(*id).await,
        ReconcileAction::Expire(id) => {
            manager.cancel(*id).await?;
            ledger.remove(*id).await?;
            Ok(())
        }
        ReconcileAction::Register(registration) => {
            manager.register(registration.clone()).await.map(|_| ())
        }
    }
}

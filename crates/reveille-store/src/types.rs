//! Notification request types.

use std::fmt;

use chrono::{DateTime, Local, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::InvalidRequest;

/// Identity of a notification and of the trigger that delivers it.
///
/// Non-negative ids are supplied by callers. Negative ids are reserved for
/// triggers the engine installs on its own behalf (health check, fallbacks).
/// Two requests with the same id replace each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(i32);

impl NotificationId {
    /// The recurring health-check trigger.
    pub const HEALTH_CHECK: Self = Self(-1);

    /// Render slot used when a fired payload cannot be decoded.
    pub const UNDECODABLE: Self = Self(i32::MIN);

    /// Number of distinct fallback slots (one per minute of a day).
    pub const FALLBACK_SLOTS: u32 = 1440;

    const FALLBACK_BASE: i32 = -2;

    const BACKUP_BASE: i32 = Self::FALLBACK_BASE - Self::FALLBACK_SLOTS as i32;

    /// Largest caller id that has a backup slot.
    pub const MAX_BACKUP_OWNER: i32 = i32::MAX + Self::BACKUP_BASE;

    /// Wrap a raw id without namespace checks.
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Wrap a caller-supplied id, rejecting the reserved namespace.
    pub fn user(raw: i32) -> Result<Self, InvalidRequest> {
        if raw < 0 {
            return Err(InvalidRequest::ReservedId(raw));
        }
        Ok(Self(raw))
    }

    /// Id of the fallback trigger occupying `slot` (wraps at one day).
    pub fn fallback_slot(slot: u32) -> Self {
        let slot = (slot % Self::FALLBACK_SLOTS) as i32;
        Self(Self::FALLBACK_BASE - slot)
    }

    /// Id of the backup trigger for the caller id `owner`.
    ///
    /// Every caller id up to [`Self::MAX_BACKUP_OWNER`] owns exactly one
    /// backup slot, below the fallback range.
    pub fn backup_for(owner: Self) -> Result<Self, InvalidRequest> {
        if owner.is_reserved() {
            return Err(InvalidRequest::ReservedId(owner.0));
        }
        if owner.0 > Self::MAX_BACKUP_OWNER {
            return Err(InvalidRequest::NoBackupSlot(owner.0));
        }
        Ok(Self(Self::BACKUP_BASE - owner.0))
    }

    /// Whether this id is a backup slot.
    pub fn is_backup(self) -> bool {
        self.0 <= Self::BACKUP_BASE && self != Self::UNDECODABLE
    }

    /// The caller id a backup slot belongs to.
    pub fn backup_owner(self) -> Option<Self> {
        self.is_backup().then(|| Self(Self::BACKUP_BASE - self.0))
    }

    /// The raw 32-bit value.
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Whether this id belongs to the engine rather than a caller.
    pub const fn is_reserved(self) -> bool {
        self.0 < 0
    }

    /// Whether this id is one of the fallback slots.
    pub fn is_fallback(self) -> bool {
        let lowest = Self::FALLBACK_BASE - (Self::FALLBACK_SLOTS as i32 - 1);
        (lowest..=Self::FALLBACK_BASE).contains(&self.0)
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a notification repeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// Deliver once at `fire_at`.
    #[default]
    None,
    /// Deliver every day at the given local wall-clock time.
    DailyAt { hour: u32, minute: u32 },
}

/// A request to show a notification at a point in time.
///
/// Timestamps carry millisecond precision, matching the persisted and
/// on-trigger representations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Stable identity; also identifies the trigger.
    pub id: NotificationId,
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// First (or only) delivery time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub fire_at: DateTime<Utc>,
    /// Repetition rule.
    #[serde(default)]
    pub recurrence: Recurrence,
}

impl NotificationRequest {
    /// Create a one-shot request.
    pub fn once(
        id: NotificationId,
        title: impl Into<String>,
        body: impl Into<String>,
        fire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            body: body.into(),
            fire_at: fire_at.trunc_subsecs(3),
            recurrence: Recurrence::None,
        }
    }

    /// Create a daily request whose first delivery is the next local `hour:minute` after `now`.
    pub fn daily(
        id: NotificationId,
        title: impl Into<String>,
        body: impl Into<String>,
        hour: u32,
        minute: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidRequest> {
        let fire_at = next_daily_occurrence(&now.with_timezone(&Local), hour, minute)
            .ok_or(InvalidRequest::InvalidTime { hour, minute })?;
        Ok(Self {
            id,
            title: title.into(),
            body: body.into(),
            fire_at: fire_at.trunc_subsecs(3),
            recurrence: Recurrence::DailyAt { hour, minute },
        })
    }

    /// Check field ranges that the type system does not enforce.
    pub fn validate(&self) -> Result<(), InvalidRequest> {
        if let Recurrence::DailyAt { hour, minute } = self.recurrence
            && (hour > 23 || minute > 59)
        {
            return Err(InvalidRequest::InvalidTime { hour, minute });
        }
        if self.fire_at.timestamp_subsec_nanos() % 1_000_000 != 0 {
            return Err(InvalidRequest::SubMillisecond(self.fire_at));
        }
        Ok(())
    }

    /// The same request with `fire_at` truncated to whole milliseconds.
    pub fn with_millisecond_precision(mut self) -> Self {
        self.fire_at = self.fire_at.trunc_subsecs(3);
        self
    }

    /// Whether this request repeats.
    pub fn is_recurring(&self) -> bool {
        !matches!(self.recurrence, Recurrence::None)
    }

    /// The next delivery time strictly after `now`, if any.
    ///
    /// One-shot requests return `None` once `fire_at` has passed. Daily
    /// requests keep `fire_at` while it is still ahead, then roll to the next
    /// occurrence in `now`'s time zone.
    pub fn next_fire_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
        if self.fire_at > *now {
            return Some(self.fire_at);
        }
        match self.recurrence {
            Recurrence::None => None,
            Recurrence::DailyAt { hour, minute } => {
                next_daily_occurrence(now, hour, minute).map(|t| t.trunc_subsecs(3))
            }
        }
    }
}

/// Next occurrence of `hour:minute` in `after`'s time zone, strictly after `after`.
///
/// Wall-clock times skipped by a DST transition roll to the following day.
/// Returns `None` for out-of-range times.
pub fn next_daily_occurrence<Tz: TimeZone>(
    after: &DateTime<Tz>,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Utc>> {
    let tz = after.timezone();
    let mut date = after.date_naive();
    for _ in 0..3 {
        let candidate = date.and_hms_opt(hour, minute, 0)?;
        if let Some(local) = tz.from_local_datetime(&candidate).earliest()
            && local > *after
        {
            return Some(local.with_timezone(&Utc));
        }
        date = date.succ_opt()?;
    }
    None
}

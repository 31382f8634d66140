use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};

use crate::error::{Error, Result};

/// When a triggered event becomes eligible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Fire once, immediately or at a fixed instant.
    Once {
        /// Fixed instant, or `None` for "as soon as possible".
        at: Option<DateTime<Utc>>,
    },

    /// Fire every `period`, starting at `start`.
    Interval {
        /// Distance between fires.
        period: TimeDelta,
        /// Registration instant; the first fire.
        start: DateTime<Utc>,
    },

    /// Fire once a day at a wall-clock time.
    Daily {
        /// Time of day.
        at: NaiveTime,
        /// Zone the time of day is read in.
        zone: DailyZone,
    },
}

/// Zone a daily time of day is read in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DailyZone {
    /// The host's local zone. Its offset is looked up for every fire, so
    /// daylight saving changes are followed.
    Local,
    /// A fixed offset from UTC.
    Fixed(FixedOffset),
}

/// Lifecycle of a trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerStatus {
    /// Waiting for its next fire time.
    Pending,
    /// Firing.
    Active,
    /// Will never fire again.
    Expired,
}

/// Schedule state machine attached to exactly one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trigger {
    schedule: Schedule,
    status: TriggerStatus,
    last_fire: Option<DateTime<Utc>>,
}

impl Trigger {
    fn from_schedule(schedule: Schedule) -> Self {
        Self {
            schedule,
            status: TriggerStatus::Pending,
            last_fire: None,
        }
    }

    /// One-shot trigger that fires as soon as possible.
    #[must_use]
    pub fn once() -> Self {
        Self::from_schedule(Schedule::Once { at: None })
    }

    /// One-shot trigger that fires at `at`.
    #[must_use]
    pub fn once_at(at: DateTime<Utc>) -> Self {
        Self::from_schedule(Schedule::Once { at: Some(at) })
    }

    /// Fixed-interval trigger registered now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTrigger`] if the period is zero or too large.
    pub fn interval(period: Duration) -> Result<Self> {
        Self::interval_from(period, Utc::now())
    }

    /// Fixed-interval trigger whose first fire is `start`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTrigger`] if the period is zero or too large.
    pub fn interval_from(period: Duration, start: DateTime<Utc>) -> Result<Self> {
        if period.is_zero() {
            return Err(Error::InvalidTrigger {
                reason: "interval period must be greater than zero".to_string(),
            });
        }
        let period = TimeDelta::from_std(period).map_err(|e| Error::InvalidTrigger {
            reason: e.to_string(),
        })?;
        Ok(Self::from_schedule(Schedule::Interval { period, start }))
    }

    /// Daily trigger at `at`, read in the host's local zone.
    #[must_use]
    pub fn daily(at: NaiveTime) -> Self {
        Self::from_schedule(Schedule::Daily {
            at,
            zone: DailyZone::Local,
        })
    }

    /// Daily trigger at `at`, read in `offset`.
    #[must_use]
    pub fn daily_with_offset(at: NaiveTime, offset: FixedOffset) -> Self {
        Self::from_schedule(Schedule::Daily {
            at,
            zone: DailyZone::Fixed(offset),
        })
    }

    /// The schedule this trigger follows.
    #[must_use]
    pub const fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> TriggerStatus {
        self.status
    }

    /// Instant of the most recent fire.
    #[must_use]
    pub const fn last_fire(&self) -> Option<DateTime<Utc>> {
        self.last_fire
    }

    /// Whether the trigger fires more than once.
    #[must_use]
    pub const fn is_periodic(&self) -> bool {
        !matches!(self.schedule, Schedule::Once { .. })
    }

    /// Next instant at or after `now` at which the event becomes eligible, or
    /// `None` once expired.
    #[must_use]
    pub fn next_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.status == TriggerStatus::Expired {
            return None;
        }

        match &self.schedule {
            Schedule::Once { at } => Some(at.map_or(now, |at| at.max(now))),
            Schedule::Interval { period, start } => match self.last_fire {
                None => Some((*start).max(now)),
                // Stay on the start + k * period grid; skip ticks already missed.
                Some(last) => Some(next_on_grid(last + *period, *period, now)),
            },
            Schedule::Daily { at, zone } => match zone {
                DailyZone::Local => next_daily(now, *at, &Local),
                DailyZone::Fixed(offset) => next_daily(now, *at, offset),
            },
        }
    }

    /// Record a fire at `fired_at`.
    pub fn fire(&mut self, fired_at: DateTime<Utc>) {
        self.status = TriggerStatus::Active;
        self.last_fire = Some(fired_at);
    }

    /// Leave the active state: `Once` expires, periodic schedules go back to
    /// pending.
    pub fn rearm(&mut self) {
        self.status = if self.is_periodic() {
            TriggerStatus::Pending
        } else {
            TriggerStatus::Expired
        };
    }
}

fn next_on_grid(next: DateTime<Utc>, period: TimeDelta, now: DateTime<Utc>) -> DateTime<Utc> {
    if next >= now {
        return next;
    }

    let period_ns = period.num_nanoseconds().unwrap_or(i64::MAX).max(1);
    let behind_ns = (now - next).num_nanoseconds().unwrap_or(i64::MAX);
    let steps = behind_ns.saturating_add(period_ns - 1) / period_ns;
    next + TimeDelta::nanoseconds(steps.saturating_mul(period_ns))
}

/// First instant strictly after `now` whose wall-clock time in `zone` is `at`.
fn next_daily<Tz: TimeZone>(now: DateTime<Utc>, at: NaiveTime, zone: &Tz) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(zone).date_naive();
    let fire = resolve_local(zone, today.and_time(at))?;
    if fire > now {
        return Some(fire);
    }
    resolve_local(zone, today.succ_opt()?.and_time(at))
}

/// Map a wall-clock time to an instant. A repeated time takes its first
/// occurrence; a skipped time moves forward by the usual one-hour gap.
fn resolve_local<Tz: TimeZone>(zone: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    zone.from_local_datetime(&local)
        .earliest()
        .or_else(|| {
            zone.from_local_datetime(&(local + TimeDelta::hours(1)))
                .earliest()
        })
        .map(|fire| fire.with_timezone(&Utc))
}

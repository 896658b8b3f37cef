//! Monthly usage reset policy
//!
//! Usage counters are zeroed once per calendar month, on the first day of the
//! month. The check compares today against the store's last reset date, so
//! repeating it on the same day is a no-op.
//!
//! By default the check runs once, when the pool manager starts. A process
//! started mid-month and never restarted therefore keeps its counters past
//! the next first-of-month. `ResetCheck::EveryAcquire` and
//! `ResetCheck::Interval` opt into re-checking while running.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate};
use key_store::{ConditionalReset, KeyStore};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Source of "today" for the reset policy.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local calendar date of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Clock pinned to a date that can be moved by hand.
#[derive(Debug)]
pub struct ManualClock {
    today: Mutex<NaiveDate>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: Mutex::new(today),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        *self.today.lock().unwrap_or_else(|e| e.into_inner()) = today;
    }
}

impl Clock for ManualClock {
    fn today(&self) -> NaiveDate {
        *self.today.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// When the pool manager runs the reset check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCheck {
    /// Only when the manager starts.
    Startup,
    /// At startup and at the beginning of every acquire.
    EveryAcquire,
    /// At startup and then on a background timer.
    Interval(Duration),
}

impl ResetCheck {
    /// Build from a mode name and an interval in seconds.
    ///
    /// The interval is only read for `"interval"` and must be non-zero there.
    pub fn from_parts(mode: &str, interval_secs: u64) -> Result<Self> {
        match mode {
            "startup" => Ok(Self::Startup),
            "every_acquire" => Ok(Self::EveryAcquire),
            "interval" if interval_secs == 0 => Err(Error::InvalidResetCheck(
                "interval reset check needs a non-zero interval".into(),
            )),
            "interval" => Ok(Self::Interval(Duration::from_secs(interval_secs))),
            other => Err(Error::InvalidResetCheck(format!(
                "unknown mode {other:?}, expected startup, every_acquire or interval"
            ))),
        }
    }

    /// Mode label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            ResetCheck::Startup => "startup",
            ResetCheck::EveryAcquire => "every_acquire",
            ResetCheck::Interval(_) => "interval",
        }
    }
}

impl fmt::Display for ResetCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetCheck::Interval(every) => write!(f, "interval({}s)", every.as_secs()),
            other => f.write_str(other.label()),
        }
    }
}

/// Result of a reset check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Today is not the first of the month.
    NotDue,
    /// Counters were already reset this month.
    AlreadyReset(NaiveDate),
    /// Counters were zeroed.
    Reset { date: NaiveDate, records: u64 },
}

impl ResetOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ResetOutcome::NotDue => "not_due",
            ResetOutcome::AlreadyReset(_) => "already_reset",
            ResetOutcome::Reset { .. } => "reset",
        }
    }
}

/// Whether counters should be reset today.
///
/// True only on the first day of a month, and only if the last reset (if
/// any) happened in a different month.
pub fn reset_due(today: NaiveDate, last_reset: Option<NaiveDate>) -> bool {
    if today.day() != 1 {
        return false;
    }
    match last_reset {
        None => true,
        Some(last) => (last.year(), last.month()) != (today.year(), today.month()),
    }
}

/// Reset every counter if `today` starts a new month.
///
/// The last-reset check and the reset run in one store critical section, so
/// concurrent callers (in this process or another one sharing the store)
/// reset at most once per month. An empty store has nothing to reset and
/// reports `NotDue`.
pub async fn maybe_reset(store: &dyn KeyStore, today: NaiveDate) -> Result<ResetOutcome> {
    if today.day() != 1 {
        debug!(%today, "not the first of the month, skipping usage reset");
        return Ok(ResetOutcome::NotDue);
    }

    let due = move |last: Option<NaiveDate>| reset_due(today, last);
    match store.reset_all_if(today, &due).await? {
        ConditionalReset::Reset(records) => {
            info!(date = %today, records, "reset usage counters for new month");
            metrics::counter!("key_pool_resets_total").increment(1);
            Ok(ResetOutcome::Reset {
                date: today,
                records,
            })
        }
        ConditionalReset::Skipped(Some(last)) => {
            debug!(%today, last_reset = %last, "usage already reset this month");
            Ok(ResetOutcome::AlreadyReset(last))
        }
        ConditionalReset::Skipped(None) => {
            debug!(%today, "no keys provisioned, skipping usage reset");
            Ok(ResetOutcome::NotDue)
        }
    }
}

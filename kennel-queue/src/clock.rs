//! Wall-clock abstraction.
//!
//! Every timestamp the queue stores (availability, lease expiry, schedule
//! slots) is read through a [`Clock`] so tests can move time by hand.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// Source of "now" for queue bookkeeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle passed between queue, scheduler and workers.
pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for deterministic tests.
///
/// Clones share the same underlying instant, so advancing one handle is
/// visible to every component holding another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Start at a fixed instant.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Start at a unix timestamp in seconds. Out-of-range values fall back to the epoch.
    pub fn at_unix(seconds: i64) -> Self {
        let start = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self::starting_at(start)
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock();
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }

    /// Jump to an arbitrary instant, backwards included.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }

    /// Share this clock as a [`SharedClock`].
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Convert a std duration into a chrono one, rejecting values chrono cannot hold.
pub(crate) fn to_chrono(duration: Duration) -> crate::QueueResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| crate::QueueError::InvalidConfig(format!("duration out of range: {duration:?}")))
}

/// `at + duration`, rejecting sums past the range chrono can represent.
pub(crate) fn offset(at: DateTime<Utc>, duration: Duration) -> crate::QueueResult<DateTime<Utc>> {
    to_chrono(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| crate::QueueError::InvalidJob(format!("{duration:?} after {at} is out of range")))
}

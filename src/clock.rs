//! Wall-clock sources.
//!
//! Window boundaries are derived from epoch time, so the clock hands out
//! `DateTime<Utc>` rather than monotonic instants. Tests drive time through
//! [`ManualClock`].

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync + Debug {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time value, so advancing one clone advances all of
/// them.
///
/// ```
/// use std::time::Duration;
/// use turnstile::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::at_epoch_secs(1_700_000_000);
/// clock.advance(Duration::from_secs(30));
/// assert_eq!(clock.now().timestamp(), 1_700_000_030);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock starting at the given number of seconds since the epoch.
    ///
    /// Out-of-range values fall back to the epoch itself.
    pub fn at_epoch_secs(secs: i64) -> Self {
        let start = Utc
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_default();
        Self::new(start)
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut current = self.current.lock();
        *current += delta;
    }

    /// Jump to a specific time (may move backwards).
    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

//! Fixed-window counter strategy.
//!
//! Each window gets its own storage slot (the window start is part of the
//! key), so windows never need resetting: the first action of a new window
//! writes to a fresh key and stale windows expire on their own. Up to twice
//! the threshold can pass across a boundary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::key::{build_key, window_start_millis};
use super::options::ResolvedOptions;
use crate::error::Result;
use crate::store::{CounterRecord, Store, StoreError};

/// Fixed-window strategy over a counter store.
pub struct FixedWindow<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> FixedWindow<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Storage key of the window containing `now`.
    pub fn build_key(&self, prefix: &str, options: &ResolvedOptions, now: DateTime<Utc>) -> String {
        build_key(prefix, &options.handle, &options.key, options.interval, true, now)
    }

    /// Number of actions recorded in the window stored under `key`.
    ///
    /// A missing slot counts as zero.
    pub async fn counter(&self, key: &str) -> Result<u64> {
        let count = match self.store.read(key).await {
            Ok(Some(CounterRecord::Count(count))) => count,
            Ok(Some(other)) => {
                warn!(key = %key, record = ?other, "Ignoring non-count record in fixed window slot");
                0
            }
            Ok(None) | Err(StoreError::NotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        trace!(key = %key, count, "Read fixed window counter");
        Ok(count)
    }

    /// Whether `counter` has reached the threshold.
    pub fn at_threshold(&self, counter: u64, options: &ResolvedOptions) -> bool {
        counter >= options.threshold
    }

    /// Record an admitted action, returning the new count.
    ///
    /// Writes `before + increment` rather than incrementing atomically: two
    /// concurrent callers reading the same `before` both get admitted.
    pub async fn increment(&self, key: &str, options: &ResolvedOptions, before: u64) -> Result<u64> {
        let count = before.saturating_add(options.increment);
        if before == 0 {
            debug!(key = %key, threshold = options.threshold, "Starting new window");
        }
        self.store
            .write(key, CounterRecord::Count(count), options.interval)
            .await?;
        Ok(count)
    }

    /// Current count without recording anything.
    pub async fn current_count(&self, key: &str) -> Result<u64> {
        self.counter(key).await
    }

    /// Clear the window stored under `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.store.delete(key).await?;
        Ok(())
    }

    /// Time until the window containing `now` closes.
    pub fn retry_after(&self, now: DateTime<Utc>, options: &ResolvedOptions) -> Duration {
        let interval_ms = options.interval.as_millis().min(i64::MAX as u128) as i64;
        let window_end = window_start_millis(now, options.interval).saturating_add(interval_ms);
        let remaining = window_end.saturating_sub(now.timestamp_millis()).max(0);
        Duration::from_millis(remaining as u64)
    }
}

//! Leaky-bucket strategy.
//!
//! The bucket fills by `increment` per admitted action and drains
//! continuously at `threshold / interval` units per second. Actions are
//! refused once the drained level reaches `burst_rate`, so short bursts above
//! the sustained rate pass while a steady flood does not.
//!
//! Only the level and the time of the last write are stored. Draining is
//! computed on every read and persisted by the next increment.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use super::key::build_key;
use super::options::ResolvedOptions;
use crate::error::Result;
use crate::store::{CounterRecord, Store, StoreError};

/// A bucket as read from the store, before draining.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    pub level: f64,
    pub updated_at: DateTime<Utc>,
}

impl Bucket {
    /// Level after draining at `drip_rate` units per second until `now`.
    ///
    /// Time running backwards (clock skew between writers) drains nothing.
    pub fn drained_level(&self, now: DateTime<Utc>, drip_rate: f64) -> f64 {
        let elapsed_ms = (now - self.updated_at).num_milliseconds().max(0);
        let drained = elapsed_ms as f64 / 1000.0 * drip_rate;
        (self.level - drained).max(0.0)
    }
}

/// Leaky-bucket strategy over a counter store, refusing actions once the
/// level reaches `burst_rate`.
pub struct LeakyBucket<'a, S: Store + ?Sized> {
    store: &'a S,
    burst_rate: u64,
}

impl<'a, S: Store + ?Sized> LeakyBucket<'a, S> {
    pub fn new(store: &'a S, burst_rate: u64) -> Self {
        Self { store, burst_rate }
    }

    /// Capacity at which actions are refused.
    pub fn burst_rate(&self) -> u64 {
        self.burst_rate
    }

    /// Storage key of the bucket. It carries no time component.
    pub fn build_key(&self, prefix: &str, options: &ResolvedOptions, now: DateTime<Utc>) -> String {
        build_key(prefix, &options.handle, &options.key, options.interval, false, now)
    }

    async fn read_bucket(&self, key: &str) -> Result<Option<Bucket>> {
        match self.store.read(key).await {
            Ok(Some(CounterRecord::Bucket { level, updated_at })) => {
                Ok(Some(Bucket { level, updated_at }))
            }
            Ok(Some(other)) => {
                warn!(key = %key, record = ?other, "Ignoring non-bucket record in leaky bucket slot");
                Ok(None)
            }
            Ok(None) | Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Effective (drained) level of the bucket under `key` at `now`.
    pub async fn counter(&self, key: &str, options: &ResolvedOptions, now: DateTime<Utc>) -> Result<f64> {
        let level = match self.read_bucket(key).await? {
            Some(bucket) => bucket.drained_level(now, options.drip_rate()),
            None => 0.0,
        };
        trace!(key = %key, level, "Read leaky bucket level");
        Ok(level)
    }

    /// Whether `level` has reached the burst capacity.
    pub fn at_threshold(&self, level: f64) -> bool {
        level >= self.burst_rate as f64
    }

    /// Record an admitted action on top of the drained level read before it.
    ///
    /// Like the fixed window, this is a plain write of `before + increment`;
    /// concurrent callers may overwrite each other's increments.
    pub async fn increment(
        &self,
        key: &str,
        options: &ResolvedOptions,
        before: f64,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let level = before + options.increment as f64;
        let ttl = drain_time(level.max(self.burst_rate as f64), options);
        self.store
            .write(
                key,
                CounterRecord::Bucket {
                    level,
                    updated_at: now,
                },
                ttl,
            )
            .await?;
        Ok(level)
    }

    /// Current drained level without recording anything.
    pub async fn current_count(&self, key: &str, options: &ResolvedOptions, now: DateTime<Utc>) -> Result<f64> {
        self.counter(key, options, now).await
    }

    /// Empty the bucket under `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.store.delete(key).await?;
        Ok(())
    }

    /// Time for `level` to drain below the burst capacity.
    pub fn retry_after(&self, level: f64, options: &ResolvedOptions) -> Duration {
        let excess = level - self.burst_rate as f64;
        if excess < 0.0 {
            return Duration::ZERO;
        }
        // Draining exactly to the capacity still refuses; wait one more ms.
        drain_time(excess, options) + Duration::from_millis(1)
    }
}

/// Time for `level` units to drain, rounded up to whole milliseconds.
fn drain_time(level: f64, options: &ResolvedOptions) -> Duration {
    let secs = level * options.interval.as_secs_f64() / options.threshold as f64;
    let millis = (secs * 1000.0).ceil();
    if millis.is_finite() && millis > 0.0 {
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    } else {
        Duration::ZERO
    }
}

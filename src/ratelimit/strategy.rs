//! Strategy selection.
//!
//! The strategy is picked from the resolved options once per call. Counts
//! are reported as `f64` so both strategies share one interface: fixed-window
//! counts are whole numbers, leaky-bucket levels are fractional.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::fixed_window::FixedWindow;
use super::leaky_bucket::LeakyBucket;
use super::options::{ResolvedOptions, StrategyKind};
use crate::error::Result;
use crate::store::Store;

/// One of the two counting strategies, bound to a store.
pub enum Strategy<'a, S: Store + ?Sized> {
    FixedWindow(FixedWindow<'a, S>),
    LeakyBucket(LeakyBucket<'a, S>),
}

impl<'a, S: Store + ?Sized> Strategy<'a, S> {
    /// The strategy the options call for.
    pub fn for_options(store: &'a S, options: &ResolvedOptions) -> Self {
        match options.strategy {
            StrategyKind::FixedWindow => Strategy::FixedWindow(FixedWindow::new(store)),
            StrategyKind::LeakyBucket { burst_rate } => {
                Strategy::LeakyBucket(LeakyBucket::new(store, burst_rate))
            }
        }
    }

    pub fn build_key(&self, prefix: &str, options: &ResolvedOptions, now: DateTime<Utc>) -> String {
        match self {
            Strategy::FixedWindow(s) => s.build_key(prefix, options, now),
            Strategy::LeakyBucket(s) => s.build_key(prefix, options, now),
        }
    }

    pub async fn counter(&self, key: &str, options: &ResolvedOptions, now: DateTime<Utc>) -> Result<f64> {
        match self {
            Strategy::FixedWindow(s) => Ok(s.counter(key).await? as f64),
            Strategy::LeakyBucket(s) => s.counter(key, options, now).await,
        }
    }

    pub fn at_threshold(&self, counter: f64, options: &ResolvedOptions) -> bool {
        match self {
            Strategy::FixedWindow(s) => s.at_threshold(counter as u64, options),
            Strategy::LeakyBucket(s) => s.at_threshold(counter),
        }
    }

    pub async fn increment(
        &self,
        key: &str,
        options: &ResolvedOptions,
        before: f64,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        match self {
            Strategy::FixedWindow(s) => Ok(s.increment(key, options, before as u64).await? as f64),
            Strategy::LeakyBucket(s) => s.increment(key, options, before, now).await,
        }
    }

    pub async fn current_count(&self, key: &str, options: &ResolvedOptions, now: DateTime<Utc>) -> Result<f64> {
        match self {
            Strategy::FixedWindow(s) => Ok(s.current_count(key).await? as f64),
            Strategy::LeakyBucket(s) => s.current_count(key, options, now).await,
        }
    }

    pub async fn reset(&self, key: &str) -> Result<()> {
        match self {
            Strategy::FixedWindow(s) => s.reset(key).await,
            Strategy::LeakyBucket(s) => s.reset(key).await,
        }
    }

    /// Wait before the next action could be admitted, given the count that
    /// caused the refusal.
    pub fn retry_after(&self, counter: f64, options: &ResolvedOptions, now: DateTime<Utc>) -> Duration {
        match self {
            Strategy::FixedWindow(s) => s.retry_after(now, options),
            Strategy::LeakyBucket(s) => s.retry_after(counter, options),
        }
    }
}

//! Call options and their resolution against registered policies.

use std::collections::HashMap;
use std::time::Duration;

use super::key::RequestKey;
use super::policy::{validate_burst_rate, validate_limits, Algorithm, Policy};
use crate::error::{Error, Result};

/// The strategy chosen for one call, with its strategy-specific settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Fixed-window counter
    FixedWindow,
    /// Leaky bucket admitting bursts up to `burst_rate`
    LeakyBucket { burst_rate: u64 },
}

impl StrategyKind {
    /// The plain algorithm name.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            StrategyKind::FixedWindow => Algorithm::FixedWindow,
            StrategyKind::LeakyBucket { .. } => Algorithm::LeakyBucket,
        }
    }
}

/// Per-call overrides. Every field left unset falls back to the policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    pub threshold: Option<u64>,
    pub interval: Option<Duration>,
    pub burst_rate: Option<u64>,
    pub strategy: Option<Algorithm>,
    /// Units recorded per admitted action (default 1)
    pub increment: Option<u64>,
    pub description: Option<String>,
}

impl CallOptions {
    /// No overrides.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threshold(mut self, threshold: u64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn burst_rate(mut self, burst_rate: u64) -> Self {
        self.burst_rate = Some(burst_rate);
        self
    }

    pub fn strategy(mut self, strategy: Algorithm) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn increment(mut self, increment: u64) -> Self {
        self.increment = Some(increment);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Fully merged and validated options for a single call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub handle: String,
    pub key: RequestKey,
    pub threshold: u64,
    pub interval: Duration,
    pub strategy: StrategyKind,
    pub increment: u64,
    pub description: Option<String>,
    pub extra: HashMap<String, serde_json::Value>,
}

impl ResolvedOptions {
    /// Drip rate of a leaky bucket, in units per second.
    pub fn drip_rate(&self) -> f64 {
        self.threshold as f64 / self.interval.as_secs_f64()
    }
}

/// Merge `policy` with `overrides` and validate the result.
///
/// Pass `None` for `policy` when the handle is not registered; that is a
/// configuration error like any invalid value.
pub fn resolve(
    handle: &str,
    key: RequestKey,
    policy: Option<&Policy>,
    overrides: &CallOptions,
) -> Result<ResolvedOptions> {
    let policy = policy.ok_or_else(|| {
        Error::Config(format!("No rate limit policy registered for handle '{}'", handle))
    })?;

    let threshold = overrides.threshold.unwrap_or(policy.threshold);
    let interval = overrides.interval.unwrap_or(policy.interval);
    validate_limits(handle, threshold, interval)?;

    let burst_rate = overrides.burst_rate.or(policy.burst_rate);
    // Explicit strategies first, then a burst_rate override implies a bucket.
    let algorithm = overrides
        .strategy
        .or(policy.strategy)
        .unwrap_or_else(|| match overrides.burst_rate {
            Some(_) => Algorithm::LeakyBucket,
            None => policy.algorithm(),
        });
    let strategy = match algorithm {
        Algorithm::FixedWindow => StrategyKind::FixedWindow,
        Algorithm::LeakyBucket => StrategyKind::LeakyBucket {
            burst_rate: validate_burst_rate(handle, threshold, burst_rate)?,
        },
    };

    let increment = overrides.increment.unwrap_or(1);
    if increment == 0 {
        return Err(Error::Config(format!(
            "{}: increment must be a positive integer",
            handle
        )));
    }

    Ok(ResolvedOptions {
        handle: handle.to_string(),
        key,
        threshold,
        interval,
        strategy,
        increment,
        description: overrides
            .description
            .clone()
            .or_else(|| policy.description.clone()),
        extra: policy.extra.clone(),
    })
}

//! Per-handle rate limit policies.
//!
//! A policy is registered once per handle, typically at startup from a
//! configuration file, and supplies the defaults every call on that handle
//! starts from.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Counting algorithm requested by a policy or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Count actions in discrete, epoch-aligned windows
    FixedWindow,
    /// Continuously draining level with a burst allowance
    LeakyBucket,
}

/// Rate limit policy for one handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Actions allowed per interval (the drip rate numerator for leaky buckets)
    pub threshold: u64,
    /// Length of the window, in seconds when read from configuration
    #[serde(with = "interval_secs")]
    pub interval: Duration,
    /// Burst capacity for leaky buckets; must exceed `threshold`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_rate: Option<u64>,
    /// Explicit algorithm. When unset, a policy with a `burst_rate` is a
    /// leaky bucket and any other is a fixed window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Algorithm>,
    /// Human readable description, carried into rate limit errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form fields passed through to call sites untouched
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Policy {
    /// A fixed-window policy.
    pub fn fixed_window(threshold: u64, interval: Duration) -> Self {
        Self {
            threshold,
            interval,
            burst_rate: None,
            strategy: None,
            description: None,
            extra: HashMap::new(),
        }
    }

    /// A leaky-bucket policy draining `threshold` units per `interval`.
    pub fn leaky_bucket(threshold: u64, interval: Duration, burst_rate: u64) -> Self {
        Self {
            burst_rate: Some(burst_rate),
            strategy: Some(Algorithm::LeakyBucket),
            ..Self::fixed_window(threshold, interval)
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a free-form field.
    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// The algorithm this policy selects by default.
    pub fn algorithm(&self) -> Algorithm {
        self.strategy.unwrap_or(if self.burst_rate.is_some() {
            Algorithm::LeakyBucket
        } else {
            Algorithm::FixedWindow
        })
    }

    /// Check the policy invariants.
    pub fn validate(&self, handle: &str) -> Result<()> {
        validate_limits(handle, self.threshold, self.interval)?;
        if self.algorithm() == Algorithm::LeakyBucket {
            validate_burst_rate(handle, self.threshold, self.burst_rate)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_limits(handle: &str, threshold: u64, interval: Duration) -> Result<()> {
    if threshold == 0 {
        return Err(Error::Config(format!(
            "{}: threshold must be a positive integer",
            handle
        )));
    }
    if interval.as_millis() == 0 {
        return Err(Error::Config(format!(
            "{}: interval must be at least one millisecond",
            handle
        )));
    }
    Ok(())
}

pub(crate) fn validate_burst_rate(handle: &str, threshold: u64, burst_rate: Option<u64>) -> Result<u64> {
    match burst_rate {
        None => Err(Error::Config(format!(
            "{}: burst_rate is required for leaky bucket policies",
            handle
        ))),
        Some(burst) if burst <= threshold => Err(Error::Config(format!(
            "{}: burst_rate ({}) must be greater than threshold ({})",
            handle, burst, threshold
        ))),
        Some(burst) => Ok(burst),
    }
}

/// Serialize durations as (possibly fractional) seconds.
mod interval_secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(interval: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if interval.subsec_nanos() == 0 {
            serializer.serialize_u64(interval.as_secs())
        } else {
            serializer.serialize_f64(interval.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| de::Error::custom(format!("invalid interval {}: {}", secs, e)))
    }
}

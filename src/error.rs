//! Error types for Turnstile.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::{RequestKey, StrategyKind};
use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown handle, invalid policy values or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The action was refused by `throttle_or_fail`.
    #[error("{0}")]
    RateLimited(Box<RateLimited>),

    /// Counter store errors other than a missing key
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the rate limit details if this is a [`Error::RateLimited`].
    pub fn as_rate_limited(&self) -> Option<&RateLimited> {
        match self {
            Error::RateLimited(limited) => Some(limited),
            _ => None,
        }
    }

    /// Whether this error is a refused action rather than a fault.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Context describing a refused action.
///
/// Carries enough detail for the caller to build a response, e.g. a
/// `Retry-After` header from [`RateLimited::retry_after`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimited {
    /// The handle of the protected operation
    pub handle: String,
    /// The request key the counter was scoped to
    pub key: RequestKey,
    /// Resolved threshold
    pub threshold: u64,
    /// Resolved interval
    pub interval: Duration,
    /// The storage key holding the counter
    pub cache_key: String,
    /// Strategy that produced the decision
    pub strategy: StrategyKind,
    /// Optional policy description
    pub description: Option<String>,
    /// Estimated wait until the next action would be admitted
    pub retry_after: Duration,
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} threshold of {} tries per {}s exceeded for key {}",
            self.handle,
            self.threshold,
            self.interval.as_secs_f64(),
            self.key
        )?;
        if let Some(description) = &self.description {
            write!(f, ", {}", description)?;
        }
        write!(f, ", hash {}", self.cache_key)
    }
}

impl From<RateLimited> for Error {
    fn from(limited: RateLimited) -> Self {
        Error::RateLimited(Box::new(limited))
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, Error>;

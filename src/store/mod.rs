//! Counter storage.
//!
//! The limiter never keeps counter state itself. Every count lives behind a
//! [`Store`] supplied by the host: anything offering read, write with a
//! time-to-live, and delete will do. No atomic compare-and-swap is assumed.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist. Stores that signal absence through an error
    /// rather than `Ok(None)` should use this variant; counters read it as
    /// zero.
    #[error("Key not found: {0}")]
    NotFound(String),

    /// The backend could not be reached or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),
}

/// A value held in the counter store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterRecord {
    /// Number of actions recorded in one fixed window
    Count(u64),
    /// Leaky-bucket fill level at the time of the last admitted action
    Bucket {
        level: f64,
        updated_at: DateTime<Utc>,
    },
}

impl CounterRecord {
    /// Encode the record as JSON, for stores that only hold strings.
    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Decode a record previously produced by [`CounterRecord::to_json`].
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

/// Key/value storage with expiry, supplied by the host application.
///
/// Implementations may be asynchronous; the limiter awaits every call before
/// proceeding.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read the record stored under `key`, if any.
    async fn read(&self, key: &str) -> Result<Option<CounterRecord>, StoreError>;

    /// Store `record` under `key`, expiring after `ttl`.
    async fn write(&self, key: &str, record: CounterRecord, ttl: Duration) -> Result<(), StoreError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

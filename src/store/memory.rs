//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{CounterRecord, Store, StoreError};
use crate::clock::{Clock, SystemClock};

/// Shortest period accepted by [`MemoryStore::spawn_purger`].
const MIN_PURGE_PERIOD: Duration = Duration::from_millis(1);

/// A stored record together with its expiry time.
#[derive(Debug, Clone)]
struct Entry {
    record: CounterRecord,
    expires_at: DateTime<Utc>,
}

/// A [`Store`] kept in a concurrent hash map.
///
/// Expiry is judged against the injected clock: expired entries are invisible
/// to reads and removed lazily, or in bulk by [`MemoryStore::purge_expired`].
/// Suitable for tests and single-process deployments.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store judging expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged, "Purged expired counter records");
        }
        purged
    }

    /// Spawn a background task calling [`MemoryStore::purge_expired`] every
    /// `every`. Abort the returned handle to stop it.
    ///
    /// Periods shorter than one millisecond, including zero, are raised to one
    /// millisecond.
    pub fn spawn_purger(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let every = every.max(MIN_PURGE_PERIOD);
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.purge_expired();
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<CounterRecord>, StoreError> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.record.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            trace!(key = %key, "Dropping expired counter record");
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn write(&self, key: &str, record: CounterRecord, ttl: Duration) -> Result<(), StoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Unavailable(format!("ttl out of range: {}", e)))?;
        let expires_at = self.clock.now() + ttl;
        self.entries
            .insert(key.to_string(), Entry { record, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::at_epoch_secs(1_700_000_000);
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let (store, _) = store();
        assert_eq!(store.read("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (store, _) = store();
        store
            .write("k", CounterRecord::Count(3), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.read("k").await.unwrap(), Some(CounterRecord::Count(3)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (store, clock) = store();
        store
            .write("k", CounterRecord::Count(1), Duration::from_secs(60))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(59));
        assert!(store.read("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.read("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _) = store();
        store
            .write("k", CounterRecord::Count(1), Duration::from_secs(60))
            .await
            .unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.read("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store();
        store
            .write("short", CounterRecord::Count(1), Duration::from_secs(10))
            .await
            .unwrap();
        store
            .write("long", CounterRecord::Count(1), Duration::from_secs(100))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.read("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_spawned_purger() {
        let (store, clock) = store();
        let store = Arc::new(store);
        store
            .write("k", CounterRecord::Count(1), Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let purger = store.spawn_purger(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());
        purger.abort();
    }

    #[tokio::test]
    async fn test_purger_with_zero_period() {
        let (store, clock) = store();
        let store = Arc::new(store);
        store
            .write("k", CounterRecord::Count(1), Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let purger = store.spawn_purger(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!purger.is_finished());
        assert!(store.is_empty());
        purger.abort();
    }
}

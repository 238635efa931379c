//! The limiter facade.
//!
//! `Limiter` owns everything that used to be process-wide in a classic
//! throttling setup: the policy registry, the disable switch and the
//! pre-throttle hook. Counter state stays in the store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, trace};

use super::key::RequestKey;
use super::options::{resolve, CallOptions, ResolvedOptions};
use super::policy::Policy;
use super::strategy::Strategy;
use crate::clock::{Clock, SystemClock};
use crate::config::TurnstileConfig;
use crate::error::{Error, RateLimited, Result};
use crate::store::Store;

/// Arguments handed to the pre-throttle hook.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleEvent {
    pub handle: String,
    pub key: RequestKey,
    pub threshold: u64,
    pub interval: Duration,
}

type BeforeThrottle = Arc<dyn Fn(&ThrottleEvent) + Send + Sync>;

/// Outcome of one check-and-record pass.
enum Decision {
    /// The limiter is disabled; nothing was read or written.
    Disabled,
    /// The action was admitted and recorded.
    Allowed { count: f64 },
    /// The action was refused.
    Throttled(RateLimited),
}

/// Rate limiting decisions over a counter store.
///
/// Safe to share across tasks. Reading a counter and recording the next
/// action are two separate store calls, so under contention a few extra
/// actions may be admitted; stores with atomic increments don't change that.
pub struct Limiter<S: Store + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    policies: RwLock<HashMap<String, Policy>>,
    disabled: AtomicUsize,
    before_throttle: RwLock<Option<BeforeThrottle>>,
}

/// Builder for [`Limiter`].
pub struct LimiterBuilder<S: Store + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    policies: Vec<(String, Policy)>,
}

impl<S: Store + ?Sized> LimiterBuilder<S> {
    /// Use `clock` instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Prepend `prefix` to every storage key.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Register a policy. Validation happens in [`LimiterBuilder::build`].
    pub fn policy(mut self, handle: impl Into<String>, policy: Policy) -> Self {
        self.policies.push((handle.into(), policy));
        self
    }

    /// Register several policies.
    pub fn policies<I, H>(mut self, policies: I) -> Self
    where
        I: IntoIterator<Item = (H, Policy)>,
        H: Into<String>,
    {
        self.policies
            .extend(policies.into_iter().map(|(h, p)| (h.into(), p)));
        self
    }

    /// Build the limiter, failing on the first invalid policy.
    pub fn build(self) -> Result<Limiter<S>> {
        let limiter = Limiter {
            store: self.store,
            clock: self.clock,
            key_prefix: self.key_prefix,
            policies: RwLock::new(HashMap::new()),
            disabled: AtomicUsize::new(0),
            before_throttle: RwLock::new(None),
        };
        for (handle, policy) in self.policies {
            limiter.register(handle, policy)?;
        }
        Ok(limiter)
    }
}

impl<S: Store> Limiter<S> {
    /// A limiter over `store` with the system clock and no policies.
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            clock: Arc::new(SystemClock::new()),
            key_prefix: String::new(),
            policies: RwLock::new(HashMap::new()),
            disabled: AtomicUsize::new(0),
            before_throttle: RwLock::new(None),
        }
    }
}

impl<S: Store + ?Sized> Limiter<S> {
    /// Start building a limiter over a shared store.
    pub fn builder(store: Arc<S>) -> LimiterBuilder<S> {
        LimiterBuilder {
            store,
            clock: Arc::new(SystemClock::new()),
            key_prefix: String::new(),
            policies: Vec::new(),
        }
    }

    /// Build a limiter from loaded configuration.
    pub fn from_config(store: Arc<S>, config: &TurnstileConfig) -> Result<Self> {
        Self::builder(store)
            .key_prefix(config.limiter.key_prefix.clone())
            .policies(config.policies.clone())
            .build()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Register (or replace) the policy for `handle`.
    pub fn register(&self, handle: impl Into<String>, policy: Policy) -> Result<()> {
        let handle = handle.into();
        policy.validate(&handle)?;
        info!(
            handle = %handle,
            threshold = policy.threshold,
            interval_secs = policy.interval.as_secs_f64(),
            strategy = ?policy.algorithm(),
            "Registered rate limit policy"
        );
        self.policies.write().insert(handle, policy);
        Ok(())
    }

    /// The policy registered for `handle`.
    pub fn policy(&self, handle: &str) -> Option<Policy> {
        self.policies.read().get(handle).cloned()
    }

    /// All registered handles, sorted.
    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.policies.read().keys().cloned().collect();
        handles.sort();
        handles
    }

    /// Install the hook run right before a throttled call reports its
    /// decision. Replaces any previous hook.
    pub fn on_before_throttle<F>(&self, hook: F)
    where
        F: Fn(&ThrottleEvent) + Send + Sync + 'static,
    {
        *self.before_throttle.write() = Some(Arc::new(hook));
    }

    /// Remove the pre-throttle hook.
    pub fn clear_before_throttle(&self) {
        *self.before_throttle.write() = None;
    }

    /// Disable throttling until the returned guard is dropped.
    ///
    /// Guards nest: throttling resumes when the last one is dropped.
    pub fn disable(&self) -> DisabledGuard<'_> {
        let depth = self.disabled.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(depth, "Rate limiting disabled");
        DisabledGuard {
            depth: &self.disabled,
        }
    }

    /// Whether any disable scope is active.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst) > 0
    }

    /// Run `f` with throttling disabled.
    pub fn with_disabled<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.disable();
        f()
    }

    /// Await `fut` with throttling disabled.
    pub async fn with_disabled_async<F: Future>(&self, fut: F) -> F::Output {
        let _guard = self.disable();
        fut.await
    }

    fn resolve(&self, handle: &str, key: RequestKey, options: &CallOptions) -> Result<ResolvedOptions> {
        let policies = self.policies.read();
        resolve(handle, key, policies.get(handle), options)
    }

    /// Read the counter and record the action unless it is at threshold.
    async fn decide(&self, handle: &str, key: RequestKey, options: &CallOptions) -> Result<Decision> {
        let resolved = self.resolve(handle, key, options)?;
        if self.is_disabled() {
            trace!(handle = %handle, "Skipping check while disabled");
            return Ok(Decision::Disabled);
        }

        let now = self.clock.now();
        let strategy = Strategy::for_options(&*self.store, &resolved);
        let cache_key = strategy.build_key(&self.key_prefix, &resolved, now);
        let counter = strategy.counter(&cache_key, &resolved, now).await?;

        trace!(
            key = %cache_key,
            counter,
            threshold = resolved.threshold,
            "Checking rate limit"
        );

        if strategy.at_threshold(counter, &resolved) {
            self.notify_before_throttle(&resolved);
            debug!(
                handle = %handle,
                key = %cache_key,
                counter,
                "Rate limit exceeded"
            );
            let retry_after = strategy.retry_after(counter, &resolved, now);
            return Ok(Decision::Throttled(RateLimited {
                handle: resolved.handle,
                key: resolved.key,
                threshold: resolved.threshold,
                interval: resolved.interval,
                cache_key,
                strategy: resolved.strategy,
                description: resolved.description,
                retry_after,
            }));
        }

        let count = strategy.increment(&cache_key, &resolved, counter, now).await?;
        Ok(Decision::Allowed { count })
    }

    fn notify_before_throttle(&self, resolved: &ResolvedOptions) {
        let hook = self.before_throttle.read().clone();
        if let Some(hook) = hook {
            hook(&ThrottleEvent {
                handle: resolved.handle.clone(),
                key: resolved.key.clone(),
                threshold: resolved.threshold,
                interval: resolved.interval,
            });
        }
    }

    /// Check and record one action. Returns `true` when it was throttled.
    ///
    /// Nothing is recorded for a throttled action. While disabled, always
    /// returns `false` without touching the store.
    #[instrument(skip(self, key, options), fields(handle = %handle))]
    pub async fn throttle(
        &self,
        handle: &str,
        key: impl Into<RequestKey>,
        options: &CallOptions,
    ) -> Result<bool> {
        Ok(matches!(
            self.decide(handle, key.into(), options).await?,
            Decision::Throttled(_)
        ))
    }

    /// Like [`Limiter::throttle`], running `action` only when the action is
    /// admitted. Returns `None` when throttled.
    pub async fn throttle_then<F, Fut, T>(
        &self,
        handle: &str,
        key: impl Into<RequestKey>,
        options: &CallOptions,
        action: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.throttle(handle, key, options).await? {
            return Ok(None);
        }
        Ok(Some(action().await))
    }

    /// Check and record one action, failing with [`Error::RateLimited`] when
    /// throttled. Returns the count after recording (0 while disabled).
    #[instrument(skip(self, key, options), fields(handle = %handle))]
    pub async fn throttle_or_fail(
        &self,
        handle: &str,
        key: impl Into<RequestKey>,
        options: &CallOptions,
    ) -> Result<f64> {
        match self.decide(handle, key.into(), options).await? {
            Decision::Disabled => Ok(0.0),
            Decision::Allowed { count } => Ok(count),
            Decision::Throttled(limited) => Err(Error::from(limited)),
        }
    }

    /// Whether the next action would be throttled. Records nothing and
    /// ignores the disable switch.
    #[instrument(skip(self, key, options), fields(handle = %handle))]
    pub async fn is_throttled(
        &self,
        handle: &str,
        key: impl Into<RequestKey>,
        options: &CallOptions,
    ) -> Result<bool> {
        let resolved = self.resolve(handle, key.into(), options)?;
        let now = self.clock.now();
        let strategy = Strategy::for_options(&*self.store, &resolved);
        let cache_key = strategy.build_key(&self.key_prefix, &resolved, now);
        let counter = strategy.counter(&cache_key, &resolved, now).await?;
        Ok(strategy.at_threshold(counter, &resolved))
    }

    /// Current count (fixed window) or drained level (leaky bucket).
    #[instrument(skip(self, key, options), fields(handle = %handle))]
    pub async fn count(
        &self,
        handle: &str,
        key: impl Into<RequestKey>,
        options: &CallOptions,
    ) -> Result<f64> {
        let resolved = self.resolve(handle, key.into(), options)?;
        let now = self.clock.now();
        let strategy = Strategy::for_options(&*self.store, &resolved);
        let cache_key = strategy.build_key(&self.key_prefix, &resolved, now);
        strategy.current_count(&cache_key, &resolved, now).await
    }

    /// Clear the counter (the current window, for fixed windows).
    #[instrument(skip(self, key, options), fields(handle = %handle))]
    pub async fn reset(
        &self,
        handle: &str,
        key: impl Into<RequestKey>,
        options: &CallOptions,
    ) -> Result<()> {
        let resolved = self.resolve(handle, key.into(), options)?;
        let now = self.clock.now();
        let strategy = Strategy::for_options(&*self.store, &resolved);
        let cache_key = strategy.build_key(&self.key_prefix, &resolved, now);
        debug!(key = %cache_key, "Resetting rate limit counter");
        strategy.reset(&cache_key).await
    }
}

/// Keeps a [`Limiter`] disabled while alive.
#[must_use = "throttling resumes as soon as the guard is dropped"]
pub struct DisabledGuard<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for DisabledGuard<'_> {
    fn drop(&mut self) {
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(depth, "Rate limiting disable scope exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{CounterRecord, MemoryStore, StoreError};
    use async_trait::async_trait;

    fn limiter() -> (Limiter<MemoryStore>, ManualClock) {
        let clock = ManualClock::at_epoch_secs(1_700_000_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = Limiter::builder(store)
            .clock(Arc::new(clock.clone()))
            .policy("logins", Policy::fixed_window(5, Duration::from_secs(60)))
            .build()
            .unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_limiter_creation() {
        let limiter = Limiter::new(MemoryStore::new());
        assert!(limiter.handles().is_empty());
        assert!(!limiter.is_disabled());
    }

    #[test]
    fn test_builder_rejects_invalid_policy() {
        let result = Limiter::builder(Arc::new(MemoryStore::new()))
            .policy("bad", Policy::fixed_window(0, Duration::from_secs(1)))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_register_and_lookup() {
        let (limiter, _) = limiter();
        limiter
            .register("uploads", Policy::leaky_bucket(10, Duration::from_secs(60), 15))
            .unwrap();

        assert_eq!(limiter.handles(), vec!["logins".to_string(), "uploads".to_string()]);
        assert_eq!(limiter.policy("uploads").unwrap().burst_rate, Some(15));
        assert!(limiter.policy("missing").is_none());
        assert!(limiter
            .register("bad", Policy::leaky_bucket(10, Duration::from_secs(60), 5))
            .is_err());
    }

    #[tokio::test]
    async fn test_throttle_increments() {
        let (limiter, _) = limiter();
        let opts = CallOptions::new();

        assert!(!limiter.throttle("logins", "u1", &opts).await.unwrap());
        assert_eq!(limiter.count("logins", "u1", &opts).await.unwrap(), 1.0);

        assert!(!limiter.throttle("logins", "u1", &opts).await.unwrap());
        assert_eq!(limiter.count("logins", "u1", &opts).await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_throttle_with_override() {
        let (limiter, _) = limiter();
        let opts = CallOptions::new().threshold(2);

        assert!(!limiter.throttle("logins", "u1", &opts).await.unwrap());
        assert!(!limiter.throttle("logins", "u1", &opts).await.unwrap());
        assert!(limiter.throttle("logins", "u1", &opts).await.unwrap());
    }

    #[tokio::test]
    async fn test_different_keys_have_separate_counters() {
        let (limiter, _) = limiter();
        let opts = CallOptions::new();

        limiter.throttle("logins", "u1", &opts).await.unwrap();
        limiter.throttle("logins", "u1", &opts).await.unwrap();
        limiter.throttle("logins", "u2", &opts).await.unwrap();

        assert_eq!(limiter.count("logins", "u1", &opts).await.unwrap(), 2.0);
        assert_eq!(limiter.count("logins", "u2", &opts).await.unwrap(), 1.0);
        assert_eq!(limiter.count("logins", (), &opts).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_unknown_handle_is_config_error() {
        let (limiter, _) = limiter();
        let err = limiter
            .throttle("nope", "u1", &CallOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_handle_fails_even_when_disabled() {
        let (limiter, _) = limiter();
        let _guard = limiter.disable();
        assert!(limiter
            .throttle("nope", "u1", &CallOptions::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_key_prefix() {
        let clock = ManualClock::at_epoch_secs(120);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = Limiter::builder(store.clone())
            .clock(Arc::new(clock))
            .key_prefix("rl:")
            .policy("api", Policy::fixed_window(5, Duration::from_secs(60)))
            .build()
            .unwrap();

        limiter.throttle("api", "k", &CallOptions::new()).await.unwrap();
        assert!(store.read("rl:api|k|120000").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_throttle_then() {
        let (limiter, _) = limiter();
        let opts = CallOptions::new().threshold(1);

        let first = limiter
            .throttle_then("logins", "u1", &opts, || async { "ran" })
            .await
            .unwrap();
        assert_eq!(first, Some("ran"));

        let second = limiter
            .throttle_then("logins", "u1", &opts, || async { "ran" })
            .await
            .unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_throttle_or_fail_carries_context() {
        let (limiter, clock) = limiter();
        let opts = CallOptions::new().threshold(1).description("slow down");

        assert_eq!(limiter.throttle_or_fail("logins", "u1", &opts).await.unwrap(), 1.0);

        clock.advance(Duration::from_secs(15));
        let err = limiter.throttle_or_fail("logins", "u1", &opts).await.unwrap_err();
        let limited = err.as_rate_limited().unwrap();
        assert_eq!(limited.handle, "logins");
        assert_eq!(limited.key, RequestKey::from("u1"));
        assert_eq!(limited.threshold, 1);
        assert_eq!(limited.interval, Duration::from_secs(60));
        assert_eq!(limited.description.as_deref(), Some("slow down"));
        assert!(limited.cache_key.starts_with("logins|u1|"));
        // 1_700_000_015 is 35s into the window starting at 1_699_999_980.
        assert_eq!(limited.retry_after, Duration::from_secs(25));
    }

    #[test]
    fn test_disable_guards_nest() {
        let (limiter, _) = limiter();
        {
            let _outer = limiter.disable();
            {
                let _inner = limiter.disable();
                assert!(limiter.is_disabled());
            }
            assert!(limiter.is_disabled());
        }
        assert!(!limiter.is_disabled());
    }

    #[test]
    fn test_with_disabled_restores_after_panic() {
        let (limiter, _) = limiter();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            limiter.with_disabled(|| panic!("boom"))
        }));
        assert!(result.is_err());
        assert!(!limiter.is_disabled());
    }

    #[test]
    fn test_with_disabled_blocking() {
        let (limiter, _) = limiter();
        let throttled = limiter.with_disabled(|| {
            tokio_test::block_on(limiter.throttle("logins", "u1", &CallOptions::new().threshold(0)))
        });
        // Resolution still validates while disabled.
        assert!(throttled.is_err());

        let throttled = limiter.with_disabled(|| {
            tokio_test::block_on(limiter.throttle("logins", "u1", &CallOptions::new()))
        });
        assert!(!throttled.unwrap());
        let count = tokio_test::block_on(limiter.count("logins", "u1", &CallOptions::new()));
        assert_eq!(count.unwrap(), 0.0);
    }

    struct UnavailableStore;

    #[async_trait]
    impl Store for UnavailableStore {
        async fn read(&self, _key: &str) -> std::result::Result<Option<CounterRecord>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn write(
            &self,
            _key: &str,
            _record: CounterRecord,
            _ttl: Duration,
        ) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_failures_propagate() {
        let limiter = Limiter::builder(Arc::new(UnavailableStore))
            .policy("logins", Policy::fixed_window(5, Duration::from_secs(60)))
            .policy("uploads", Policy::leaky_bucket(10, Duration::from_secs(60), 15))
            .build()
            .unwrap();
        let opts = CallOptions::new();

        for handle in ["logins", "uploads"] {
            let err = limiter.throttle(handle, "u1", &opts).await.unwrap_err();
            assert!(matches!(err, Error::Store(StoreError::Unavailable(_))));
            let err = limiter.count(handle, "u1", &opts).await.unwrap_err();
            assert!(matches!(err, Error::Store(StoreError::Unavailable(_))));
        }
    }
}

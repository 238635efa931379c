//! Turnstile - Rate Limiting Decisions
//!
//! Given a handle naming a protected operation and a request key, decide
//! whether the next action is allowed or throttled. Two strategies are
//! available: a fixed-window counter with a hard reset at every window
//! boundary, and a leaky bucket that drains continuously and tolerates short
//! bursts. Counter state lives in a host-supplied [`store::Store`].
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use turnstile::ratelimit::{CallOptions, Limiter, Policy};
//! use turnstile::store::MemoryStore;
//!
//! # tokio_test::block_on(async {
//! let limiter = Limiter::builder(Arc::new(MemoryStore::new()))
//!     .policy("logins", Policy::fixed_window(5, Duration::from_secs(60)))
//!     .build()?;
//!
//! let throttled = limiter.throttle("logins", "user-42", &CallOptions::new()).await?;
//! assert!(!throttled);
//! # Ok::<(), turnstile::error::Error>(())
//! # }).unwrap();
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

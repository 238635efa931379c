//! Rate limiting strategies and the limiter facade.

mod fixed_window;
mod key;
mod leaky_bucket;
mod limiter;
mod options;
mod policy;
mod strategy;

pub use fixed_window::FixedWindow;
pub use key::{build_key, window_start_millis, KeyPart, RequestKey};
pub use leaky_bucket::{Bucket, LeakyBucket};
pub use limiter::{DisabledGuard, Limiter, LimiterBuilder, ThrottleEvent};
pub use options::{resolve, CallOptions, ResolvedOptions, StrategyKind};
pub use policy::{Algorithm, Policy};
pub use strategy::Strategy;

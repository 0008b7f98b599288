#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Distributed rate limiting over a shared counter store, with the resilience
//! shell built in: retry, circuit breaker, per-call timeouts, and an explicit
//! fail-open/fail-closed policy for when the store is down.
//!
//! ## Features
//!
//! - **Sliding-window limiter** backed by an atomic store-side check
//! - **Fixed-window counter** behind a distributed lock, for stores without
//!   scripted execution
//! - **Token and leaky buckets** for process-local smoothing
//! - **Named limiter registry** with a `"default"` fallback
//! - **Outcome metrics** that tell limited users apart from a broken limiter
//! - **In-memory store** for tests and single-process use; Redis behind the
//!   `redis` feature
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::{LimiterConfig, LimiterRegistry, MemoryStore, Outcome, RateLimitGate};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = LimiterRegistry::new()
//!         .register("auth", LimiterConfig::new(Duration::from_secs(60), 5, "rl"))
//!         .unwrap();
//!     let gate = RateLimitGate::builder(Arc::new(MemoryStore::new()))
//!         .registry(registry)
//!         .build()
//!         .unwrap();
//!
//!     match gate.check("auth", "198.51.100.7").await {
//!         Outcome::Allowed => { /* handle the request */ }
//!         Outcome::Denied { retry_after } => { /* 429 with Retry-After */ let _ = retry_after; }
//!         Outcome::Unavailable => { /* 503, limiter itself is down */ }
//!     }
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod fixed_window;
pub mod gate;
pub mod jitter;
pub mod leaky_bucket;
pub mod limiter;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod sliding_window;
pub mod store;
pub mod token_bucket;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use circuit_breaker::{Breaker, BreakerConfig, BreakerConfigError, BreakerState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Settings, Strategy};
pub use error::{LimitError, StoreError};
pub use fixed_window::FixedWindow;
pub use gate::{GateBuildError, GateBuilder, Outcome, RateLimitGate};
pub use jitter::Jitter;
pub use leaky_bucket::LeakyBucket;
pub use limiter::{KeyedLimiter, Verdict};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, OutcomeKind};
pub use registry::{CheckRequest, LimiterConfig, LimiterRegistry, RegistryError};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use sliding_window::SlidingWindow;
pub use store::{CounterStore, LockToken, MemoryStore, WindowReply};
pub use token_bucket::TokenBucket;

#[cfg(feature = "redis")]
pub use store::redis::{RedisStore, RedisStoreConfig};

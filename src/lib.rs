#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Distributed rate limiting for async Rust. Every limiter replica evaluates
//! requests against one shared store, so limits hold across the fleet rather
//! than per process.
//!
//! ## Features
//!
//! - **Five algorithms** behind one call: token bucket, leaky bucket, fixed
//!   window, sliding-window log, sliding-window counter
//! - **Shared state** through a small atomic store contract (increment with
//!   expiry, compare-and-swap, read with TTL)
//! - **Degraded operation**: store timeouts and a circuit breaker feed a
//!   per-policy fail-open or fail-closed answer
//! - **Policy resolution** by client, tier, and endpoint, hot-reloadable
//! - **HTTP contract**: `X-RateLimit-*` headers, `Retry-After`, and a JSON `429` body
//! - **Tower middleware** and a **client-side adaptive limiter** that backs
//!   off on `429`
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate::{ClientKey, InMemoryStore, LimitPolicy, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
//!     let policy = LimitPolicy::token_bucket(5, 1.0);
//!     let key = ClientKey::new("acme", "search");
//!
//!     for _ in 0..5 {
//!         assert!(limiter.evaluate(&key, &policy, 0).await.unwrap().is_allowed());
//!     }
//!     let denied = limiter.evaluate(&key, &policy, 0).await.unwrap();
//!     assert!(!denied.is_allowed());
//!     assert_eq!(denied.retry_after(), Some(std::time::Duration::from_secs(1)));
//! }
//! ```

pub mod algorithms;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod decision;
pub mod encoder;
pub mod error;
pub mod key;
pub mod limiter;
pub mod middleware;
pub mod policy;
pub mod prelude;
pub mod resolver;
pub mod sleeper;
pub mod snapshot;
pub mod store;
pub mod telemetry;

// Re-exports
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use client::{AdaptiveClientLimiter, ClientLimiterConfig, ClientState, Feedback};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use decision::{Decision, DecisionReason};
pub use encoder::{encode, EncodedDecision, RateLimitBody};
pub use error::{LimitError, StoreError, ThrottleError};
pub use key::ClientKey;
pub use limiter::{LimiterOptions, RateLimiter};
pub use middleware::{RateLimitLayer, RateLimitService, RequestIdentity};
pub use policy::{Algorithm, FailureMode, LimitPolicy, MatchCriteria, PolicyConfig, PolicyRule, StalenessBias};
pub use resolver::PolicyResolver;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use snapshot::{Snapshot, SnapshotCell};
pub use store::{FaultyStore, GuardedStore, InMemoryStore, StateStore, StoredValue};

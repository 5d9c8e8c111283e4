//! Client side of the shared state store.
//!
//! Every limiter replica consults the same store, and the store's per-key
//! atomic primitives are the only serialization point for decisions:
//!
//! - [`StateStore::increment_with_expiry`]: atomic add, TTL set when the key is created.
//! - [`StateStore::compare_and_swap`]: replace a value only if it still equals what was read.
//! - [`StateStore::get_with_ttl`]: read a value and its remaining lifetime.
//!
//! Operations are linearizable per key; nothing is promised across keys. A key
//! that expires or is evicted between a read and a write simply looks absent,
//! which the algorithms read as "no prior usage".
//!
//! Implementations:
//! - [`InMemoryStore`]: single-process store with TTLs, for tests and single-node use.
//! - [`FaultyStore`]: wrapper injecting outages and latency.
//! - [`GuardedStore`]: wrapper bounding every call with a timeout and a circuit breaker.

use std::time::Duration;

use async_trait::async_trait;

use crate::StoreError;

pub mod fault;
pub mod guarded;
pub mod memory;

pub use fault::FaultyStore;
pub use guarded::GuardedStore;
pub use memory::InMemoryStore;

/// A value read from the store with its remaining time-to-live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: String,
    /// `None` when the key never expires.
    pub ttl: Option<Duration>,
}

/// Atomic key-value primitives the limiter needs from its backing store.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Add `delta` to the integer under `key`, creating it at 0 first if absent.
    ///
    /// `ttl` is applied only when the key is created, so a window counter
    /// expires at a fixed instant no matter how often it is bumped.
    /// Returns the new value.
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, StoreError>;

    /// Write `new` (with a fresh `ttl`) only if the current value equals `expected`.
    ///
    /// `expected == None` means "only if the key is absent". Returns `Ok(false)`
    /// when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Read `key` and its remaining lifetime; `None` if absent or expired.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>, StoreError>;
}

#[async_trait]
impl<S> StateStore for std::sync::Arc<S>
where
    S: StateStore + ?Sized,
{
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        (**self).increment_with_expiry(key, delta, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).compare_and_swap(key, expected, new, ttl).await
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        (**self).get_with_ttl(key).await
    }
}

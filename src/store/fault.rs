use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{StateStore, StoredValue};
use crate::StoreError;

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    latency_millis: AtomicU64,
    calls: AtomicUsize,
}

/// Wraps a store and injects outages or latency. Clones share the switches.
///
/// Used to exercise fail-open/fail-closed fallbacks, deadlines, and the breaker.
#[derive(Debug, Clone)]
pub struct FaultyStore<S> {
    inner: S,
    faults: Arc<Faults>,
}

impl<S> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, faults: Arc::default() }
    }

    /// Make every call fail with [`StoreError::ConnectionLost`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it reaches the inner store.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.faults.latency_millis.store(millis, Ordering::SeqCst);
    }

    /// Calls that reached this wrapper (including failed ones).
    pub fn calls(&self) -> usize {
        self.faults.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn gate(&self) -> Result<(), StoreError> {
        self.faults.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.faults.latency_millis.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLost("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: StateStore> StateStore for FaultyStore<S> {
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        self.gate().await?;
        self.inner.increment_with_expiry(key, delta, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.gate().await?;
        self.inner.compare_and_swap(key, expected, new, ttl).await
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        self.gate().await?;
        self.inner.get_with_ttl(key).await
    }
}

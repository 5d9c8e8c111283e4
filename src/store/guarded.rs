use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{StateStore, StoredValue};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::StoreError;

/// Default bound on one store round trip; the limiter sits on the hot path.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(25);

/// Store wrapper that bounds every call with a timeout and routes it through a
/// [`CircuitBreaker`]. Timeouts count as breaker failures, so a slow store
/// trips the breaker the same way an unreachable one does.
#[derive(Debug, Clone)]
pub struct GuardedStore {
    inner: Arc<dyn StateStore>,
    timeout: Duration,
    breaker: CircuitBreaker,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn StateStore>, timeout: Duration, breaker: CircuitBreaker) -> Self {
        Self { inner, timeout, breaker }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn guard<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.timeout;
        self.breaker
            .execute(|| async move {
                match tokio::time::timeout(timeout, op).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout(timeout)),
                }
            })
            .await
    }
}

#[async_trait]
impl StateStore for GuardedStore {
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        self.guard(self.inner.increment_with_expiry(key, delta, ttl)).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.guard(self.inner.compare_and_swap(key, expected, new, ttl)).await
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        self.guard(self.inner.get_with_ttl(key)).await
    }
}

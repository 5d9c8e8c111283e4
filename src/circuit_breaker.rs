//! Circuit breaker guarding calls to the shared store, built on lock-free atomics.
//!
//! Only transient faults ([`StoreError::is_transient`]) count as failures. While
//! the breaker is open, calls are refused with [`StoreError::CircuitOpen`]
//! without touching the store, which lets the limiter fall back to its
//! configured fail-open/fail-closed answer immediately.

use crate::clock::{Clock, MonotonicClock};
use crate::StoreError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Store calls flow normally.
    Closed,
    /// Store calls are refused until the recovery timeout elapses.
    Open,
    /// A limited number of probe calls test whether the store recovered.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: usize },
    #[error("recovery_timeout must be > 0 (got {0:?})")]
    InvalidRecoveryTimeout(Duration),
    #[error("half_open_max_calls must be > 0 (got {provided})")]
    InvalidHalfOpenLimit { provided: usize },
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    recovery_timeout: Duration,
    half_open_max_calls: usize,
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: usize,
        recovery_timeout: Duration,
        half_open_max_calls: usize,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if recovery_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidRecoveryTimeout(recovery_timeout));
        }
        if half_open_max_calls == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: 0 });
        }
        Ok(Self { failure_threshold, recovery_timeout, half_open_max_calls })
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::MAX,
            half_open_max_calls: usize::MAX,
        }
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }
}

impl Default for CircuitBreakerConfig {
    /// Five consecutive faults open the breaker for one second.
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(1), half_open_max_calls: 1 }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

/// Breaker shared by every clone via `Arc`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_calls: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Force the breaker closed and clear counters.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.failure_count.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.half_open_calls.store(0, Ordering::Release);
    }

    /// Run a store operation under breaker protection.
    ///
    /// - **Closed**: runs the operation; consecutive transient faults are counted.
    /// - **Open**: refuses with [`StoreError::CircuitOpen`] until `recovery_timeout` elapses.
    /// - **HalfOpen**: admits up to `half_open_max_calls` probes; a success closes, a
    ///   transient fault reopens.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
        Op: FnOnce() -> Fut,
    {
        struct HalfOpenGuard<'a> {
            state: &'a BreakerState,
        }
        impl Drop for HalfOpenGuard<'_> {
            fn drop(&mut self) {
                self.state.half_open_calls.fetch_sub(1, Ordering::Release);
            }
        }
        let mut guard: Option<HalfOpenGuard<'_>> = None;

        loop {
            match self.state() {
                CircuitState::Closed => break,
                CircuitState::Open => {
                    let elapsed = self.open_for();
                    if elapsed < self.config.recovery_timeout {
                        return Err(self.open_error(elapsed));
                    }
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!("store circuit breaker → half-open");
                            self.state.half_open_calls.store(1, Ordering::Release);
                            guard = Some(HalfOpenGuard { state: &self.state });
                            break;
                        }
                        // Someone else moved it; re-evaluate.
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(self.open_error(self.open_for()));
                    }
                    guard = Some(HalfOpenGuard { state: &self.state });
                    break;
                }
            }
        }

        let result = operation().await;
        drop(guard);

        match &result {
            Err(e) if e.is_transient() => self.on_failure(),
            _ => self.on_success(),
        }
        result
    }

    fn open_for(&self) -> Duration {
        let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
        Duration::from_millis(self.clock.now_millis().saturating_sub(opened_at))
    }

    fn open_error(&self, open_for: Duration) -> StoreError {
        StoreError::CircuitOpen {
            failure_count: self.state.failure_count.load(Ordering::Acquire),
            open_for,
        }
    }

    fn on_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("store circuit breaker → closed");
                }
            }
            CircuitState::Closed => self.state.failure_count.store(0, Ordering::Release),
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "store circuit breaker: probe failed → open");
                }
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "store circuit breaker → open"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}

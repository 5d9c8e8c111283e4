//! Limiter core: one entry point that turns (key, policy, now) into a [`Decision`].
//!
//! Each evaluation runs the policy's algorithm against the shared store
//! through a [`GuardedStore`], so every store call is bounded by a timeout and
//! a circuit breaker. When the store cannot answer (fault, timeout, open
//! breaker, or an expired caller deadline), the policy's [`FailureMode`]
//! decides instead of surfacing the error.
//!
//! The only state kept in process is the local deny cache: after a denial
//! with a retry instant, deny-biased policies answer repeat requests for the
//! same key from the cache until that instant. The cache only ever denies,
//! and only for as long as the authoritative answer said to wait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::algorithms::{self, Evaluation};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::decision::{Decision, DecisionReason};
use crate::key::ClientKey;
use crate::policy::{FailureMode, LimitPolicy, StalenessBias};
use crate::store::guarded::DEFAULT_STORE_TIMEOUT;
use crate::store::{GuardedStore, StateStore};
use crate::telemetry::{
    emit_best_effort, BreakerEvent, DecisionEvent, FallbackEvent, LimiterEvent, NullSink,
    TelemetrySink,
};
use crate::{LimitError, StoreError};

/// Longest retry-after a fail-closed denial will suggest.
const MAX_FAIL_CLOSED_RETRY: Duration = Duration::from_secs(60);

/// Tuning knobs for [`RateLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterOptions {
    /// Bound on each store round trip.
    pub store_timeout: Duration,
    /// Breaker guarding the store.
    pub breaker: CircuitBreakerConfig,
    /// Compare-and-swap attempts before a request is denied for contention.
    pub cas_attempts: usize,
    /// Whether deny-biased policies may answer from the local deny cache.
    pub deny_cache: bool,
    /// Maximum keys held in the deny cache.
    pub deny_cache_capacity: usize,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            breaker: CircuitBreakerConfig::default(),
            cas_attempts: 3,
            deny_cache: true,
            deny_cache_capacity: 10_000,
        }
    }
}

impl LimiterOptions {
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_cas_attempts(mut self, attempts: usize) -> Self {
        self.cas_attempts = attempts.max(1);
        self
    }

    pub fn with_deny_cache(mut self, enabled: bool) -> Self {
        self.deny_cache = enabled;
        self
    }

    pub fn with_deny_cache_capacity(mut self, capacity: usize) -> Self {
        self.deny_cache_capacity = capacity;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedDenial {
    until_millis: u64,
    limit: u64,
}

/// Local denials keyed by store key. Never authoritative.
#[derive(Debug)]
struct DenyCache {
    entries: Mutex<HashMap<String, CachedDenial>>,
    capacity: usize,
}

impl DenyCache {
    fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), capacity }
    }

    fn lookup(&self, key: &str, now: u64) -> Option<Decision> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let hit = *entries.get(key)?;
        if hit.until_millis <= now {
            entries.remove(key);
            return None;
        }
        let retry = Duration::from_millis(hit.until_millis - now);
        Some(
            Decision::deny(hit.limit, hit.until_millis, retry)
                .with_reason(DecisionReason::CachedDenial),
        )
    }

    fn remember(&self, key: String, decision: &Decision, now: u64) {
        if decision.is_allowed() || decision.reset_at_millis() <= now || self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, hit| hit.until_millis > now);
            if entries.len() >= self.capacity {
                return;
            }
        }
        entries.insert(
            key,
            CachedDenial { until_millis: decision.reset_at_millis(), limit: decision.limit() },
        );
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Distributed rate limiter over a shared [`StateStore`].
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct RateLimiter<Sink = NullSink> {
    store: Arc<GuardedStore>,
    options: LimiterOptions,
    deny_cache: DenyCache,
    observed_breaker: Mutex<CircuitState>,
    sink: Sink,
}

impl RateLimiter<NullSink> {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_options(store, LimiterOptions::default())
    }

    pub fn with_options(store: Arc<dyn StateStore>, options: LimiterOptions) -> Self {
        let breaker = CircuitBreaker::new(options.breaker.clone());
        Self::with_breaker(store, options, breaker)
    }

    /// Use a pre-built breaker, e.g. one driven by a manual clock.
    pub fn with_breaker(
        store: Arc<dyn StateStore>,
        options: LimiterOptions,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            store: Arc::new(GuardedStore::new(store, options.store_timeout, breaker)),
            deny_cache: DenyCache::new(options.deny_cache_capacity),
            options,
            observed_breaker: Mutex::new(CircuitState::Closed),
            sink: NullSink,
        }
    }
}

impl<Sink> RateLimiter<Sink>
where
    Sink: TelemetrySink,
    <Sink as tower::Service<LimiterEvent>>::Future: Send + 'static,
{
    /// Attach a telemetry sink.
    pub fn with_sink<NewSink>(self, sink: NewSink) -> RateLimiter<NewSink>
    where
        NewSink: TelemetrySink,
    {
        RateLimiter {
            store: self.store,
            options: self.options,
            deny_cache: self.deny_cache,
            observed_breaker: self.observed_breaker,
            sink,
        }
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.store.breaker_state()
    }

    /// Keys currently answered from the deny cache (expired entries included
    /// until they are next touched).
    pub fn cached_denials(&self) -> usize {
        self.deny_cache.len()
    }

    /// Decide whether the request identified by `key` is admitted under `policy`.
    ///
    /// `now` is milliseconds on a clock shared by every replica (Unix time in
    /// production). Fails only with [`LimitError::InvalidPolicy`]; store
    /// trouble yields the policy's fail-open or fail-closed decision.
    pub async fn evaluate(
        &self,
        key: &ClientKey,
        policy: &LimitPolicy,
        now: u64,
    ) -> Result<Decision, LimitError> {
        policy.validate()?;
        let started = Instant::now();
        let decision = self.decide(key, policy, now, None).await;
        self.finish(key, policy, &decision, started).await;
        Ok(decision)
    }

    /// [`evaluate`](Self::evaluate) with the store work bounded by a caller
    /// deadline.
    ///
    /// When the deadline passes first, the in-flight evaluation is dropped and
    /// the failure mode decides. Counter increments it had already made are
    /// refunded, so the fallback is the only decision the store reflects.
    pub async fn evaluate_with_deadline(
        &self,
        key: &ClientKey,
        policy: &LimitPolicy,
        now: u64,
        deadline: Duration,
    ) -> Result<Decision, LimitError> {
        policy.validate()?;
        let started = Instant::now();
        let decision = self.decide(key, policy, now, Some(deadline)).await;
        self.finish(key, policy, &decision, started).await;
        Ok(decision)
    }

    /// Like [`evaluate`](Self::evaluate) but surfaces store failures as
    /// [`LimitError::Store`] instead of applying the failure mode, and skips
    /// the deny cache. For callers that want to make the fallback call
    /// themselves.
    pub async fn try_evaluate(
        &self,
        key: &ClientKey,
        policy: &LimitPolicy,
        now: u64,
    ) -> Result<Decision, LimitError> {
        policy.validate()?;
        let decision = self.run(key, policy, now).await?;
        self.observe_breaker().await;
        Ok(decision)
    }

    async fn decide(
        &self,
        key: &ClientKey,
        policy: &LimitPolicy,
        now: u64,
        deadline: Option<Duration>,
    ) -> Decision {
        if let Some(hit) = self.cached(key, policy, now) {
            return hit;
        }
        let outcome = match deadline {
            None => self.run(key, policy, now).await.map_err(|e| e.to_string()),
            Some(deadline) => match tokio::time::timeout(deadline, self.run(key, policy, now)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("deadline of {deadline:?} exceeded")),
            },
        };
        match outcome {
            Ok(decision) => {
                self.remember(key, policy, &decision, now);
                decision
            }
            Err(cause) => self.fallback(key, policy, now, cause).await,
        }
    }

    async fn run(
        &self,
        key: &ClientKey,
        policy: &LimitPolicy,
        now: u64,
    ) -> Result<Decision, StoreError> {
        let store: Arc<dyn StateStore> = self.store.clone();
        algorithms::evaluate(Evaluation {
            store: &store,
            key,
            policy,
            now,
            cas_attempts: self.options.cas_attempts.max(1),
        })
        .await
    }

    fn uses_deny_cache(&self, policy: &LimitPolicy) -> bool {
        self.options.deny_cache && policy.bias() == StalenessBias::Deny
    }

    fn cached(&self, key: &ClientKey, policy: &LimitPolicy, now: u64) -> Option<Decision> {
        if !self.uses_deny_cache(policy) {
            return None;
        }
        self.deny_cache.lookup(&key.storage_key(policy.algorithm()), now)
    }

    fn remember(&self, key: &ClientKey, policy: &LimitPolicy, decision: &Decision, now: u64) {
        if self.uses_deny_cache(policy) && decision.reason() == DecisionReason::Evaluated {
            self.deny_cache.remember(key.storage_key(policy.algorithm()), decision, now);
        }
    }

    async fn fallback(
        &self,
        key: &ClientKey,
        policy: &LimitPolicy,
        now: u64,
        cause: String,
    ) -> Decision {
        let decision = match policy.failure_mode() {
            FailureMode::FailOpen => {
                Decision::allow(policy.effective_capacity(), 0, now.saturating_add(policy.window_millis()))
                    .with_reason(DecisionReason::FailOpen)
            }
            FailureMode::FailClosed => {
                let retry = self
                    .options
                    .breaker
                    .recovery_timeout()
                    .clamp(Duration::from_secs(1), MAX_FAIL_CLOSED_RETRY);
                let retry_ms = u64::try_from(retry.as_millis()).unwrap_or(u64::MAX);
                Decision::deny(policy.effective_capacity(), now.saturating_add(retry_ms), retry)
                    .with_reason(DecisionReason::FailClosed)
            }
        };
        tracing::warn!(
            key = %key,
            algorithm = policy.algorithm().as_str(),
            reason = decision.reason().as_str(),
            cause = %cause,
            "rate limit store unavailable; applying failure mode"
        );
        emit_best_effort(
            self.sink.clone(),
            LimiterEvent::Fallback(FallbackEvent {
                key: key.to_string(),
                reason: decision.reason(),
                cause,
            }),
        )
        .await;
        decision
    }

    async fn finish(&self, key: &ClientKey, policy: &LimitPolicy, decision: &Decision, started: Instant) {
        let elapsed = started.elapsed();
        tracing::debug!(
            key = %key,
            algorithm = policy.algorithm().as_str(),
            allowed = decision.is_allowed(),
            remaining = decision.remaining(),
            reason = decision.reason().as_str(),
            elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            "rate limit decision"
        );
        emit_best_effort(
            self.sink.clone(),
            LimiterEvent::Decision(DecisionEvent {
                key: key.to_string(),
                algorithm: policy.algorithm(),
                allowed: decision.is_allowed(),
                remaining: decision.remaining(),
                reason: decision.reason(),
                elapsed,
            }),
        )
        .await;
        self.observe_breaker().await;
    }

    /// Emit an event when the breaker state differs from the last one seen.
    async fn observe_breaker(&self) {
        let current = self.store.breaker_state();
        let previous = {
            let mut seen = self.observed_breaker.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *seen, current)
        };
        if previous == current {
            return;
        }
        let event = match current {
            CircuitState::Open => BreakerEvent::Opened,
            CircuitState::HalfOpen => BreakerEvent::HalfOpen,
            CircuitState::Closed => BreakerEvent::Closed,
        };
        emit_best_effort(self.sink.clone(), LimiterEvent::Breaker(event)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{FaultyStore, InMemoryStore};
    use crate::telemetry::MemorySink;

    fn key() -> ClientKey {
        ClientKey::new("acme", "search")
    }

    #[tokio::test]
    async fn rejects_invalid_policy() {
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()));
        let policy = LimitPolicy::fixed_window(0, Duration::from_secs(1));
        let err = limiter.evaluate(&key(), &policy, 0).await.unwrap_err();
        assert!(matches!(err, LimitError::InvalidPolicy(_)));
    }

    #[tokio::test]
    async fn fail_open_admits_with_zero_remaining() {
        let faulty = FaultyStore::new(InMemoryStore::new());
        faulty.set_unavailable(true);
        let limiter = RateLimiter::new(Arc::new(faulty));
        let policy = LimitPolicy::token_bucket(5, 1.0);
        let decision = limiter.evaluate(&key(), &policy, 1_000).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 0);
        assert_eq!(decision.reason(), DecisionReason::FailOpen);
        assert_eq!(decision.reset_at_millis(), 1_000 + policy.window_millis());
    }

    #[tokio::test]
    async fn fail_closed_denies_with_retry() {
        let faulty = FaultyStore::new(InMemoryStore::new());
        faulty.set_unavailable(true);
        let limiter = RateLimiter::new(Arc::new(faulty));
        let policy = LimitPolicy::token_bucket(5, 1.0).with_failure_mode(FailureMode::FailClosed);
        let decision = limiter.evaluate(&key(), &policy, 0).await.unwrap();
        assert!(!decision.is_allowed());
        assert_eq!(decision.reason(), DecisionReason::FailClosed);
        assert_eq!(decision.retry_after(), Some(Duration::from_secs(1)));
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fallback_is_logged_with_cause() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(SharedWriter(buffer.clone()))
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let faulty = FaultyStore::new(InMemoryStore::new());
        faulty.set_unavailable(true);
        let limiter = RateLimiter::new(Arc::new(faulty));
        limiter.evaluate(&key(), &LimitPolicy::token_bucket(5, 1.0), 0).await.unwrap();

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("rate limit store unavailable"), "{logs}");
        assert!(logs.contains("injected outage"));
        assert!(logs.contains("fail_open"));
    }

    #[tokio::test]
    async fn try_evaluate_surfaces_store_errors() {
        let faulty = FaultyStore::new(InMemoryStore::new());
        faulty.set_unavailable(true);
        let limiter = RateLimiter::new(Arc::new(faulty));
        let err = limiter.try_evaluate(&key(), &LimitPolicy::token_bucket(1, 1.0), 0).await.unwrap_err();
        assert!(matches!(err, LimitError::Store(StoreError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn deny_biased_policy_answers_from_cache() {
        let faulty = FaultyStore::new(InMemoryStore::new());
        let limiter = RateLimiter::new(Arc::new(faulty.clone()));
        let policy = LimitPolicy::token_bucket(1, 1.0).with_bias(StalenessBias::Deny);
        assert!(limiter.evaluate(&key(), &policy, 0).await.unwrap().is_allowed());
        assert!(!limiter.evaluate(&key(), &policy, 0).await.unwrap().is_allowed());
        let calls = faulty.calls();

        let cached = limiter.evaluate(&key(), &policy, 500).await.unwrap();
        assert_eq!(cached.reason(), DecisionReason::CachedDenial);
        assert_eq!(cached.retry_after(), Some(Duration::from_millis(500)));
        assert_eq!(faulty.calls(), calls, "cached denial skips the store");

        let after = limiter.evaluate(&key(), &policy, 1_000).await.unwrap();
        assert!(after.is_allowed());
    }

    #[tokio::test]
    async fn allow_biased_policy_never_uses_cache() {
        let faulty = FaultyStore::new(InMemoryStore::new());
        let limiter = RateLimiter::new(Arc::new(faulty.clone()));
        let policy = LimitPolicy::token_bucket(1, 1.0);
        limiter.evaluate(&key(), &policy, 0).await.unwrap();
        limiter.evaluate(&key(), &policy, 0).await.unwrap();
        let calls = faulty.calls();
        let denied = limiter.evaluate(&key(), &policy, 10).await.unwrap();
        assert_eq!(denied.reason(), DecisionReason::Evaluated);
        assert!(faulty.calls() > calls);
        assert_eq!(limiter.cached_denials(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_applies_failure_mode() {
        let faulty = FaultyStore::new(InMemoryStore::new());
        faulty.set_latency(Duration::from_millis(10));
        let options = LimiterOptions::default().with_store_timeout(Duration::from_secs(5));
        let limiter = RateLimiter::with_options(Arc::new(faulty), options);
        let policy = LimitPolicy::fixed_window(10, Duration::from_secs(1))
            .with_failure_mode(FailureMode::FailClosed);
        let decision = limiter
            .evaluate_with_deadline(&key(), &policy, 0, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(decision.reason(), DecisionReason::FailClosed);
    }

    async fn stored(store: &InMemoryStore, key: &str) -> Option<String> {
        store.get_with_ttl(key).await.unwrap().map(|v| v.value)
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_counter_evaluation_leaves_no_charge() {
        let faulty = FaultyStore::new(InMemoryStore::new());
        faulty.set_latency(Duration::from_millis(10));
        let options = LimiterOptions::default().with_store_timeout(Duration::from_secs(5));
        let limiter = RateLimiter::with_options(Arc::new(faulty.clone()), options);
        let policy = LimitPolicy::sliding_window_counter(5, Duration::from_secs(1), 4)
            .with_failure_mode(FailureMode::FailClosed);

        // The increment lands at 10ms; the deadline hits during the reads after it.
        let decision = limiter
            .evaluate_with_deadline(&key(), &policy, 1_000, Duration::from_millis(15))
            .await
            .unwrap();
        assert_eq!(decision.reason(), DecisionReason::FailClosed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let bucket = format!("{}:4", key().storage_key(policy.algorithm()));
        assert_eq!(stored(faulty.inner(), &bucket).await.as_deref(), Some("0"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_refund_still_completes() {
        let faulty = FaultyStore::new(InMemoryStore::new());
        faulty.set_latency(Duration::from_millis(10));
        let options = LimiterOptions::default().with_store_timeout(Duration::from_secs(5));
        let limiter = RateLimiter::with_options(Arc::new(faulty.clone()), options);
        let policy = LimitPolicy::fixed_window(1, Duration::from_secs(10))
            .with_failure_mode(FailureMode::FailClosed);
        assert!(limiter.evaluate(&key(), &policy, 0).await.unwrap().is_allowed());

        // Over the limit at +10ms; the deadline cuts the refund call short.
        let decision = limiter
            .evaluate_with_deadline(&key(), &policy, 0, Duration::from_millis(15))
            .await
            .unwrap();
        assert_eq!(decision.reason(), DecisionReason::FailClosed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let window = format!("{}:0", key().storage_key(policy.algorithm()));
        assert_eq!(stored(faulty.inner(), &window).await.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn breaker_transitions_are_emitted() {
        let faulty = FaultyStore::new(InMemoryStore::new());
        faulty.set_unavailable(true);
        let clock = ManualClock::starting_at(0);
        let config = CircuitBreakerConfig::new(2, Duration::from_secs(1), 1).unwrap();
        let breaker = CircuitBreaker::new(config.clone()).with_clock(clock.clone());
        let sink = MemorySink::new();
        let limiter = RateLimiter::with_breaker(
            Arc::new(faulty.clone()),
            LimiterOptions::default().with_breaker(config),
            breaker,
        )
        .with_sink(sink.clone());
        let policy = LimitPolicy::fixed_window(10, Duration::from_secs(1));

        for _ in 0..3 {
            limiter.evaluate(&key(), &policy, 0).await.unwrap();
        }
        assert_eq!(limiter.breaker_state(), CircuitState::Open);

        faulty.set_unavailable(false);
        clock.advance(1_500);
        let decision = limiter.evaluate(&key(), &policy, 0).await.unwrap();
        assert_eq!(decision.reason(), DecisionReason::Evaluated);

        let breaker_events: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                LimiterEvent::Breaker(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(breaker_events, vec![BreakerEvent::Opened, BreakerEvent::Closed]);
        assert!(sink.events().iter().any(|e| matches!(e, LimiterEvent::Fallback(_))));
    }
}

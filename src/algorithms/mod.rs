//! Admission algorithms.
//!
//! Each algorithm is a free `evaluate` function over the same inputs:
//! the store, the client key, the policy, and the caller's `now`. The limiter
//! dispatches on [`Algorithm`]; there is no shared base state.
//!
//! State lives in the store and is never cached here:
//! - token bucket, leaky bucket, sliding-window log: one JSON record per key,
//!   updated with a read / compute / compare-and-swap loop.
//! - fixed window, sliding-window counter: integer counters per window or
//!   sub-window, updated with atomic increments.
//!
//! Arithmetic is synchronous; the only suspension points are store calls.
//! An evaluation dropped at one of them leaves no charge behind: counter
//! increments are held by a [`Charge`] that refunds itself unless settled.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::decision::{Decision, DecisionReason};
use crate::key::ClientKey;
use crate::policy::{Algorithm, LimitPolicy};
use crate::store::StateStore;
use crate::StoreError;

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_counter;
pub mod sliding_log;
pub mod token_bucket;

/// Fixed-point scale for fractional tokens and queue levels.
pub(crate) const MICROS_PER_UNIT: u64 = 1_000_000;

/// Back-off suggested to a request that lost every compare-and-swap attempt.
const CONTENTION_RETRY: Duration = Duration::from_millis(100);

/// Inputs shared by every algorithm for one evaluation.
#[derive(Clone, Copy)]
pub struct Evaluation<'a> {
    pub store: &'a Arc<dyn StateStore>,
    pub key: &'a ClientKey,
    pub policy: &'a LimitPolicy,
    pub now: u64,
    pub cas_attempts: usize,
}

impl Evaluation<'_> {
    fn storage_key(&self) -> String {
        self.key.storage_key(self.policy.algorithm())
    }

    fn limit(&self) -> u64 {
        self.policy.effective_capacity()
    }
}

/// Run the algorithm the policy selects.
pub async fn evaluate(eval: Evaluation<'_>) -> Result<Decision, StoreError> {
    match eval.policy.algorithm() {
        Algorithm::TokenBucket => token_bucket::evaluate(eval).await,
        Algorithm::LeakyBucket => leaky_bucket::evaluate(eval).await,
        Algorithm::FixedWindow => fixed_window::evaluate(eval).await,
        Algorithm::SlidingWindowLog => sliding_log::evaluate(eval).await,
        Algorithm::SlidingWindowCounter => sliding_counter::evaluate(eval).await,
    }
}

/// A counter increment that has reached the store but whose decision has not
/// been returned yet.
///
/// Dropped unsettled (the evaluation was cancelled or a later store call
/// failed), it spawns the compensating decrement so the fallback decision is
/// the only one visible.
#[must_use = "an unsettled charge is refunded on drop"]
pub(crate) struct Charge {
    store: Arc<dyn StateStore>,
    key: String,
    ttl: Duration,
    settled: bool,
}

impl Charge {
    /// Increment `key` by one and hold the charge. Returns the new count.
    pub(crate) async fn take(
        store: &Arc<dyn StateStore>,
        key: String,
        ttl: Duration,
    ) -> Result<(u64, Charge), StoreError> {
        let count = store.increment_with_expiry(&key, 1, ttl).await?;
        let charge = Charge { store: Arc::clone(store), key, ttl, settled: false };
        Ok((u64::try_from(count).unwrap_or(0), charge))
    }

    /// The decision stands; keep the increment.
    pub(crate) fn keep(mut self) {
        self.settled = true;
    }

    /// Undo the increment before returning the decision.
    pub(crate) async fn refund(mut self) -> Result<(), StoreError> {
        self.store.increment_with_expiry(&self.key, -1, self.ttl).await?;
        self.settled = true;
        Ok(())
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "no runtime to refund an abandoned charge");
            return;
        };
        tracing::debug!(key = %self.key, "evaluation abandoned; refunding counter charge");
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let ttl = self.ttl;
        runtime.spawn(async move {
            if let Err(e) = store.increment_with_expiry(&key, -1, ttl).await {
                tracing::warn!(key = %key, error = %e, "failed to refund abandoned charge");
            }
        });
    }
}

/// Outcome of one pure state step.
pub(crate) struct Step<S> {
    pub state: S,
    pub decision: Decision,
    /// Whether `state` should be written back.
    pub persist: bool,
}

/// Read the record under `key`, run `step` on it, and publish the result with
/// compare-and-swap, retrying when another writer got in between.
///
/// An absent or undecodable record is handed to `step` as `None` (a fresh
/// key); the swap still expects the raw value that was read, so a concurrent
/// writer is never overwritten.
pub(crate) async fn compare_and_swap_loop<S, F>(
    eval: &Evaluation<'_>,
    key: &str,
    ttl: Duration,
    mut step: F,
) -> Result<Decision, StoreError>
where
    S: Serialize + DeserializeOwned,
    F: FnMut(Option<S>) -> Step<S>,
{
    for attempt in 0..eval.cas_attempts {
        let current = eval.store.get_with_ttl(key).await?;
        let raw = current.as_ref().map(|v| v.value.as_str());
        let state = raw.and_then(|raw| decode::<S>(key, raw));
        let Step { state, decision, persist } = step(state);
        if !persist {
            return Ok(decision);
        }
        let encoded = encode(key, &state)?;
        if eval.store.compare_and_swap(key, raw, &encoded, ttl).await? {
            return Ok(decision);
        }
        tracing::trace!(key, attempt, "compare-and-swap lost a race; retrying");
    }
    tracing::debug!(key, attempts = eval.cas_attempts, "compare-and-swap contention; denying");
    let retry_ms = u64::try_from(CONTENTION_RETRY.as_millis()).unwrap_or(u64::MAX);
    Ok(Decision::deny(eval.limit(), eval.now.saturating_add(retry_ms), CONTENTION_RETRY)
        .with_reason(DecisionReason::Contention))
}

fn decode<S: DeserializeOwned>(key: &str, raw: &str) -> Option<S> {
    match serde_json::from_str(raw) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!(key, error = %e, "undecodable limiter state; treating key as fresh");
            None
        }
    }
}

fn encode<S: Serialize>(key: &str, state: &S) -> Result<String, StoreError> {
    serde_json::to_string(state)
        .map_err(|e| StoreError::Corrupt { key: key.to_string(), reason: e.to_string() })
}

/// Parse a counter value; unparsable counters read as zero.
pub(crate) fn parse_counter(key: &str, raw: &str) -> u64 {
    match raw.parse::<i64>() {
        Ok(n) => u64::try_from(n).unwrap_or(0),
        Err(e) => {
            tracing::warn!(key, error = %e, "undecodable counter; reading as zero");
            0
        }
    }
}

/// Micro-units accrued over `elapsed_ms` at `per_sec`, rounded down.
pub(crate) fn accrued_micros(elapsed_ms: u64, per_sec: f64) -> u64 {
    // per_sec units/s == per_sec * 1000 micro-units/ms
    let micros = (elapsed_ms as f64) * (per_sec * 1000.0);
    if micros.is_finite() && micros > 0.0 {
        if micros >= u64::MAX as f64 {
            u64::MAX
        } else {
            micros.floor() as u64
        }
    } else {
        0
    }
}

/// Milliseconds needed to accrue `micros` at `per_sec`, rounded up.
pub(crate) fn millis_to_accrue(micros: u64, per_sec: f64) -> u64 {
    let per_ms = per_sec * 1000.0;
    if micros == 0 || !(per_ms.is_finite() && per_ms > 0.0) {
        return 0;
    }
    let ms = (micros as f64 / per_ms).ceil();
    if ms >= u64::MAX as f64 {
        u64::MAX
    } else {
        ms as u64
    }
}

/// TTL after which an idle bucket is indistinguishable from a fresh one.
pub(crate) fn idle_ttl(policy: &LimitPolicy) -> Duration {
    let micros = policy.effective_capacity().saturating_mul(MICROS_PER_UNIT);
    Duration::from_millis(millis_to_accrue(micros, policy.refill_per_sec()).max(1))
}

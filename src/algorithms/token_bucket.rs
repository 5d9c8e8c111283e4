//! Token bucket: tokens refill at a constant rate up to capacity; each admit
//! consumes one. Idle clients accumulate a burst of up to `capacity` admits.
//!
//! Invariants:
//! - `0 <= tokens <= capacity` after every step (fixed-point, never negative).
//! - Refill is applied before the consumption check, also on denial, and the
//!   refilled balance is persisted either way.
//! - Consumption requires one *whole* token; fractional balances round down.
//! - A balance above the current capacity (policy shrank) is clamped on read.

use serde::{Deserialize, Serialize};

use super::{accrued_micros, compare_and_swap_loop, idle_ttl, millis_to_accrue, Evaluation, Step, MICROS_PER_UNIT};
use crate::decision::Decision;
use crate::StoreError;
use std::time::Duration;

/// Persisted bucket record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketState {
    /// Balance in millionths of a token.
    micro_tokens: u64,
    last_refill_ms: u64,
}

impl TokenBucketState {
    /// A full bucket as of `now`.
    pub fn full(capacity: u64, now: u64) -> Self {
        Self { micro_tokens: capacity.saturating_mul(MICROS_PER_UNIT), last_refill_ms: now }
    }

    pub fn tokens(&self) -> f64 {
        self.micro_tokens as f64 / MICROS_PER_UNIT as f64
    }

    pub fn last_refill_ms(&self) -> u64 {
        self.last_refill_ms
    }

    /// Add tokens for the time since the last refill, capped at `capacity`.
    ///
    /// A `now` behind the stored timestamp (clock skew between replicas) adds
    /// nothing and leaves the timestamp where it is.
    pub fn refill(&mut self, now: u64, capacity: u64, per_sec: f64) {
        let cap = capacity.saturating_mul(MICROS_PER_UNIT);
        if now > self.last_refill_ms {
            let added = accrued_micros(now - self.last_refill_ms, per_sec);
            self.micro_tokens = self.micro_tokens.saturating_add(added);
            self.last_refill_ms = now;
        }
        self.micro_tokens = self.micro_tokens.min(cap);
    }

    /// Take one whole token if available.
    pub fn try_consume(&mut self) -> bool {
        if self.micro_tokens >= MICROS_PER_UNIT {
            self.micro_tokens -= MICROS_PER_UNIT;
            true
        } else {
            false
        }
    }

    /// Whole tokens available.
    pub fn whole_tokens(&self) -> u64 {
        self.micro_tokens / MICROS_PER_UNIT
    }

    /// Milliseconds until the whole-token count next increases; zero when full.
    pub fn millis_to_next_token(&self, capacity: u64, per_sec: f64) -> u64 {
        if self.whole_tokens() >= capacity {
            return 0;
        }
        let missing = MICROS_PER_UNIT - (self.micro_tokens % MICROS_PER_UNIT);
        millis_to_accrue(missing, per_sec).max(1)
    }
}

/// Apply one request to `state` (or a fresh full bucket).
pub fn step(state: Option<TokenBucketState>, capacity: u64, per_sec: f64, now: u64) -> (TokenBucketState, Decision) {
    let mut bucket = state.unwrap_or_else(|| TokenBucketState::full(capacity, now));
    bucket.refill(now, capacity, per_sec);
    let allowed = bucket.try_consume();
    let wait = bucket.millis_to_next_token(capacity, per_sec);
    let reset_at = now.saturating_add(wait);
    let decision = if allowed {
        Decision::allow(capacity, bucket.whole_tokens(), reset_at)
    } else {
        Decision::deny(capacity, reset_at, Duration::from_millis(wait))
    };
    (bucket, decision)
}

pub async fn evaluate(eval: Evaluation<'_>) -> Result<Decision, StoreError> {
    let key = eval.storage_key();
    let capacity = eval.limit();
    let per_sec = eval.policy.refill_per_sec();
    let now = eval.now;
    compare_and_swap_loop(&eval, &key, idle_ttl(eval.policy), |state| {
        let (state, decision) = step(state, capacity, per_sec, now);
        Step { state, decision, persist: true }
    })
    .await
}

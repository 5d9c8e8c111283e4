//! Leaky bucket as a virtual queue: the level rises by one per admit and
//! drains at the leak rate. No timer runs per key; the drain since the last
//! visit is computed lazily on each evaluation.
//!
//! Unlike the token bucket, this smooths the admitted rate: an idle client
//! does not bank a burst beyond the queue's free slots.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{accrued_micros, compare_and_swap_loop, idle_ttl, millis_to_accrue, Evaluation, Step, MICROS_PER_UNIT};
use crate::decision::Decision;
use crate::StoreError;

/// Persisted queue record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakyBucketState {
    /// Queue length in millionths of an item.
    micro_level: u64,
    last_leak_ms: u64,
}

impl LeakyBucketState {
    pub fn empty(now: u64) -> Self {
        Self { micro_level: 0, last_leak_ms: now }
    }

    /// Queue length as a whole number of pending items (partially drained items count).
    pub fn queued(&self) -> u64 {
        (self.micro_level + MICROS_PER_UNIT - 1) / MICROS_PER_UNIT
    }

    pub fn level(&self) -> f64 {
        self.micro_level as f64 / MICROS_PER_UNIT as f64
    }

    /// Drain for the time since the last visit; clamp to `capacity`.
    pub fn leak(&mut self, now: u64, capacity: u64, per_sec: f64) {
        if now > self.last_leak_ms {
            let drained = accrued_micros(now - self.last_leak_ms, per_sec);
            self.micro_level = self.micro_level.saturating_sub(drained);
            self.last_leak_ms = now;
        }
        self.micro_level = self.micro_level.min(capacity.saturating_mul(MICROS_PER_UNIT));
    }

    /// Enqueue one item if the queue is not full.
    pub fn try_enqueue(&mut self, capacity: u64) -> bool {
        if self.queued() < capacity {
            self.micro_level += MICROS_PER_UNIT;
            true
        } else {
            false
        }
    }

    /// Milliseconds until one more slot frees up; zero when empty.
    pub fn millis_to_next_slot(&self, per_sec: f64) -> u64 {
        if self.micro_level == 0 {
            return 0;
        }
        let partial = self.micro_level % MICROS_PER_UNIT;
        let excess = if partial == 0 { MICROS_PER_UNIT } else { partial };
        millis_to_accrue(excess, per_sec).max(1)
    }
}

pub fn step(state: Option<LeakyBucketState>, capacity: u64, per_sec: f64, now: u64) -> (LeakyBucketState, Decision) {
    let mut queue = state.unwrap_or_else(|| LeakyBucketState::empty(now));
    queue.leak(now, capacity, per_sec);
    let allowed = queue.try_enqueue(capacity);
    let wait = queue.millis_to_next_slot(per_sec);
    let reset_at = now.saturating_add(wait);
    let decision = if allowed {
        Decision::allow(capacity, capacity.saturating_sub(queue.queued()), reset_at)
    } else {
        Decision::deny(capacity, reset_at, Duration::from_millis(wait))
    };
    (queue, decision)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_then_denies() {
        let mut state = None;
        for expected_remaining in (0..3).rev() {
            let (next, decision) = step(state, 3, 1.0, 0);
            assert!(decision.is_allowed());
            assert_eq!(decision.remaining(), expected_remaining);
            state = Some(next);
        }
        let (_, decision) = step(state, 3, 1.0, 0);
        assert!(!decision.is_allowed());
        assert_eq!(decision.retry_after(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn drains_at_leak_rate() {
        let mut queue = LeakyBucketState { micro_level: 3 * MICROS_PER_UNIT, last_leak_ms: 0 };
        queue.leak(500, 3, 2.0);
        assert_eq!(queue.queued(), 2);
        queue.leak(10_000, 3, 2.0);
        assert_eq!(queue.queued(), 0);
        assert_eq!(queue.millis_to_next_slot(2.0), 0);
    }

    #[test]
    fn partially_drained_item_still_occupies_slot() {
        // 2.5 items queued in a 3-slot queue: 3 slots in use.
        let mut queue = LeakyBucketState { micro_level: 2_500_000, last_leak_ms: 0 };
        assert!(!queue.try_enqueue(3));
        assert_eq!(queue.millis_to_next_slot(1.0), 500);
    }

    #[test]
    fn idle_client_gets_no_burst_beyond_capacity() {
        let queue = LeakyBucketState::empty(0);
        let mut state = Some(queue);
        let mut admitted = 0;
        for _ in 0..10 {
            let (next, decision) = step(state, 4, 1.0, 1_000_000);
            admitted += u32::from(decision.is_allowed());
            state = Some(next);
        }
        assert_eq!(admitted, 4);
    }
}

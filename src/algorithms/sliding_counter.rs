//! Sliding-window counter: the window is split into `buckets` sub-windows,
//! each an integer counter in the store. A request is admitted when the
//! weighted count of the trailing window, before this request, is below the
//! limit. The oldest sub-window only partly overlaps the trailing window and
//! is weighted by the fraction still inside it.
//!
//! The weighting assumes requests in the oldest sub-window were spread
//! evenly, so admits in any trailing window stay within one sub-window's
//! worth of traffic of the exact log algorithm. Space is O(buckets) per key.
//!
//! A window that is not a multiple of `buckets` is truncated to the nearest
//! multiple of the sub-window length.

use std::time::Duration;

use super::{parse_counter, Charge, Evaluation};
use crate::decision::Decision;
use crate::StoreError;

/// Sub-window counts around `now`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Counts {
    /// Sub-window containing `now`, including this request when charged.
    pub current: u64,
    /// Sub-windows fully inside the trailing window, excluding the current one.
    pub full: u64,
    /// The partially overlapping oldest sub-window.
    pub oldest: u64,
    /// Fraction of the oldest sub-window still inside the trailing window.
    pub oldest_weight: f64,
}

impl Counts {
    /// Estimated requests in the trailing window.
    pub fn weighted(&self) -> f64 {
        (self.current + self.full) as f64 + self.oldest as f64 * self.oldest_weight
    }
}

/// Fraction of sub-window `index - buckets` still inside the window ending at `now`.
pub fn oldest_weight(now: u64, sub_ms: u64) -> f64 {
    let into_current = now % sub_ms;
    1.0 - into_current as f64 / sub_ms as f64
}

/// Milliseconds until the pre-request weighted count drops below `limit`,
/// assuming no further traffic. `base` is the count outside the oldest
/// sub-window.
fn millis_until_admit(counts: &Counts, base: u64, limit: u64, now: u64, sub_ms: u64) -> u64 {
    let boundary = now - now % sub_ms + sub_ms;
    if base >= limit || counts.oldest == 0 {
        return (boundary - now).max(1);
    }
    // Need oldest * weight(t) < limit - base with weight(t) = (boundary - t) / sub.
    let headroom = (limit - base) as f64 / counts.oldest as f64;
    let threshold = boundary as f64 - sub_ms as f64 * headroom;
    let first_ok = threshold.floor() as u64 + 1;
    first_ok.saturating_sub(now).clamp(1, boundary - now)
}

pub async fn evaluate(eval: Evaluation<'_>) -> Result<Decision, StoreError> {
    let limit = eval.limit();
    let buckets = u64::from(eval.policy.buckets().max(1));
    let sub_ms = (eval.policy.window_millis() / buckets).max(1);
    let now = eval.now;
    let index = now / sub_ms;
    let base_key = eval.storage_key();
    let bucket_key = |i: u64| format!("{base_key}:{i}");

    // The current sub-window is read again as the oldest `buckets` sub-windows
    // later, so it has to live that long.
    let ttl_ms = (index + buckets + 1).saturating_mul(sub_ms).saturating_sub(now);
    let ttl = Duration::from_millis(ttl_ms);

    // Reads below may be cancelled or fail; the charge refunds itself then.
    let (current, charge) = Charge::take(eval.store, bucket_key(index), ttl).await?;

    let mut full = 0;
    for i in (index + 1).saturating_sub(buckets)..index {
        full += read_counter(&eval, &bucket_key(i)).await?;
    }
    let oldest = match index.checked_sub(buckets) {
        Some(i) => read_counter(&eval, &bucket_key(i)).await?,
        None => 0,
    };
    let counts = Counts { current, full, oldest, oldest_weight: oldest_weight(now, sub_ms) };

    // Admit when the count before this request is below the limit.
    if counts.weighted() < (limit + 1) as f64 {
        charge.keep();
        let remaining = (limit as f64 - counts.weighted()).floor().max(0.0) as u64;
        let reset_at = now - now % sub_ms + sub_ms;
        return Ok(Decision::allow(limit, remaining, reset_at));
    }

    // Denials never count, or a saturating client's own rejected traffic
    // would hold the estimate above the limit.
    charge.refund().await?;
    let wait = millis_until_admit(&counts, current.saturating_sub(1) + full, limit, now, sub_ms);
    Ok(Decision::deny(limit, now + wait, Duration::from_millis(wait)))
}

async fn read_counter(eval: &Evaluation<'_>, key: &str) -> Result<u64, StoreError> {
    Ok(eval
        .store
        .get_with_ttl(key)
        .await?
        .map(|stored| parse_counter(key, &stored.value))
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ClientKey;
    use crate::policy::LimitPolicy;
    use crate::store::{InMemoryStore, StateStore};
    use std::sync::Arc;

    fn store() -> Arc<dyn StateStore> {
        Arc::new(InMemoryStore::new())
    }

    async fn run(store: &Arc<dyn StateStore>, policy: &LimitPolicy, now: u64) -> Decision {
        let key = ClientKey::new("c", "e");
        evaluate(Evaluation { store, key: &key, policy, now, cas_attempts: 3 }).await.unwrap()
    }

    #[test]
    fn weight_decays_across_sub_window() {
        assert_eq!(oldest_weight(1_000, 100), 1.0);
        assert_eq!(oldest_weight(1_050, 100), 0.5);
        assert_eq!(oldest_weight(1_099, 100), 0.01);
    }

    #[tokio::test]
    async fn admits_up_to_limit_within_window() {
        let store = store();
        let policy = LimitPolicy::sliding_window_counter(4, Duration::from_secs(1), 4);
        for expected in [3, 2, 1, 0] {
            let decision = run(&store, &policy, 10).await;
            assert!(decision.is_allowed());
            assert_eq!(decision.remaining(), expected);
        }
        let denied = run(&store, &policy, 10).await;
        assert!(!denied.is_allowed());
        assert_eq!(denied.retry_after(), Some(Duration::from_millis(240)));
    }

    #[tokio::test]
    async fn oldest_sub_window_is_weighted() {
        let store = store();
        let policy = LimitPolicy::sliding_window_counter(4, Duration::from_secs(1), 4);
        for _ in 0..4 {
            assert!(run(&store, &policy, 0).await.is_allowed());
        }
        // At t=1000 the first sub-window [0, 250) weighs 1.0: still full.
        assert!(!run(&store, &policy, 1_000).await.is_allowed());
        // At t=1125 it weighs 0.5: two more fit.
        assert!(run(&store, &policy, 1_125).await.is_allowed());
        assert!(run(&store, &policy, 1_125).await.is_allowed());
        let denied = run(&store, &policy, 1_125).await;
        assert!(!denied.is_allowed());
        // base 2, oldest 4: admits again once 4 * w < 2, i.e. after t=1125.
        assert_eq!(denied.retry_after(), Some(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn denial_before_first_full_window_waits_for_boundary() {
        let store = store();
        let policy = LimitPolicy::sliding_window_counter(1, Duration::from_millis(100), 2);
        assert!(run(&store, &policy, 20).await.is_allowed());
        let denied = run(&store, &policy, 20).await;
        assert_eq!(denied.retry_after(), Some(Duration::from_millis(30)));
    }
}

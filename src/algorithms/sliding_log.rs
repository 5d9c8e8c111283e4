//! Sliding-window log: the timestamps of admitted requests in the trailing
//! window, stored as one sorted JSON array per key.
//!
//! Exact: no trailing window of length `W` ever contains more than `limit`
//! admits. Memory is O(limit) per key. Denied requests are not logged and do
//! not write to the store.

use std::time::Duration;

use super::{compare_and_swap_loop, Evaluation, Step};
use crate::decision::Decision;
use crate::StoreError;

/// Drop entries older than the window ending at `now`.
///
/// An entry exactly `window_ms` old is still inside the window.
pub fn evict(log: &mut Vec<u64>, now: u64, window_ms: u64) {
    log.retain(|&ts| now.saturating_sub(ts) <= window_ms);
}

pub(crate) fn step(log: Option<Vec<u64>>, limit: u64, window_ms: u64, now: u64) -> Step<Vec<u64>> {
    let mut log = log.unwrap_or_default();
    evict(&mut log, now, window_ms);
    let used = u64::try_from(log.len()).unwrap_or(u64::MAX);

    if used < limit {
        // Keep the log sorted even if replica clocks disagree slightly.
        let at = log.partition_point(|&ts| ts <= now);
        log.insert(at, now);
        let oldest = log.first().copied().unwrap_or(now);
        let reset_at = oldest.saturating_add(window_ms).saturating_add(1);
        let decision = Decision::allow(limit, limit - used - 1, reset_at);
        return Step { state: log, decision, persist: true };
    }

    // The oldest entries have to age out until one slot is free. With a
    // shrunken limit several may need to go.
    let excess = usize::try_from(used - limit).unwrap_or(usize::MAX);
    let blocking = log.get(excess).copied().unwrap_or(now);
    let reset_at = blocking.saturating_add(window_ms).saturating_add(1);
    let retry = Duration::from_millis(reset_at.saturating_sub(now).max(1));
    Step { state: log, decision: Decision::deny(limit, reset_at, retry), persist: false }
}

pub async fn evaluate(eval: Evaluation<'_>) -> Result<Decision, StoreError> {
    let key = eval.storage_key();
    let limit = eval.limit();
    let window_ms = eval.policy.window_millis().max(1);
    let now = eval.now;
    let ttl = Duration::from_millis(window_ms.saturating_add(1));
    compare_and_swap_loop(&eval, &key, ttl, |log| step(log, limit, window_ms, now)).await
}

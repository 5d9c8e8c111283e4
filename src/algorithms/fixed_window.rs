//! Fixed window: one counter per epoch-aligned window, bumped atomically.
//!
//! Windows start at multiples of the window length on the caller's clock, so
//! every replica agrees on the boundaries. The counter key carries the window
//! index and expires at the window's end.
//!
//! Known limitation: a client can spend its full limit at the end of one
//! window and again at the start of the next, admitting up to twice the limit
//! in a span of one window around the boundary. Use the sliding variants when
//! that burst matters.

use std::time::Duration;

use super::{Charge, Evaluation};
use crate::decision::Decision;
use crate::StoreError;

/// Start of the window containing `now`.
pub fn window_start(now: u64, window_ms: u64) -> u64 {
    now - now % window_ms
}

pub async fn evaluate(eval: Evaluation<'_>) -> Result<Decision, StoreError> {
    let window_ms = eval.policy.window_millis().max(1);
    let limit = eval.limit();
    let start = window_start(eval.now, window_ms);
    let end = start.saturating_add(window_ms);
    let key = format!("{}:{}", eval.storage_key(), start / window_ms);
    let ttl = Duration::from_millis(end - eval.now);

    let (count, charge) = Charge::take(eval.store, key, ttl).await?;

    if count <= limit {
        charge.keep();
        return Ok(Decision::allow(limit, limit - count, end));
    }
    if eval.policy.charge_denied() {
        charge.keep();
    } else {
        // Undo our own bump; the window total then counts admits only.
        charge.refund().await?;
    }
    Ok(Decision::deny(limit, end, Duration::from_millis(end - eval.now)))
}

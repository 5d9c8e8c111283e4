//! The result of one limiter evaluation.

use std::fmt;
use std::time::Duration;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Evaluated against shared state in the store.
    Evaluated,
    /// Store unavailable; admitted by the fail-open policy.
    FailOpen,
    /// Store unavailable; denied by the fail-closed policy.
    FailClosed,
    /// Denied from the local deny cache without a store round trip.
    CachedDenial,
    /// Lost every compare-and-swap attempt against concurrent writers.
    Contention,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionReason::Evaluated => "evaluated",
            DecisionReason::FailOpen => "fail_open",
            DecisionReason::FailClosed => "fail_closed",
            DecisionReason::CachedDenial => "cached_denial",
            DecisionReason::Contention => "contention",
        }
    }

    /// Whether the decision was made without consulting shared state.
    pub fn is_degraded(self) -> bool {
        matches!(self, DecisionReason::FailOpen | DecisionReason::FailClosed)
    }
}

/// Admit/deny verdict plus the numbers the response headers are built from.
///
/// Created fresh per request and never persisted. Timestamps are milliseconds
/// on the clock the caller passed to `evaluate` (Unix time in production).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset_at_millis: u64,
    retry_after: Option<Duration>,
    reason: DecisionReason,
}

impl Decision {
    /// Admit with `remaining` further admits estimated before `reset_at_millis`.
    pub fn allow(limit: u64, remaining: u64, reset_at_millis: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: remaining.min(limit),
            reset_at_millis,
            retry_after: None,
            reason: DecisionReason::Evaluated,
        }
    }

    /// Deny; the caller may retry after `retry_after`.
    pub fn deny(limit: u64, reset_at_millis: u64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at_millis,
            retry_after: Some(retry_after),
            reason: DecisionReason::Evaluated,
        }
    }

    pub fn with_reason(mut self, reason: DecisionReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Next instant at which `remaining` could increase.
    pub fn reset_at_millis(&self) -> u64 {
        self.reset_at_millis
    }

    /// Present only on denial.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn reason(&self) -> DecisionReason {
        self.reason
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.allowed {
            write!(f, "allowed({}/{} remaining, {})", self.remaining, self.limit, self.reason.as_str())
        } else {
            write!(
                f,
                "denied(retry after {:?}, {})",
                self.retry_after.unwrap_or_default(),
                self.reason.as_str()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_clamps_remaining_to_limit() {
        let d = Decision::allow(5, 9, 1_000);
        assert!(d.is_allowed());
        assert_eq!(d.remaining(), 5);
        assert_eq!(d.retry_after(), None);
        assert_eq!(d.reason(), DecisionReason::Evaluated);
    }

    #[test]
    fn deny_has_retry_and_zero_remaining() {
        let d = Decision::deny(5, 2_000, Duration::from_millis(750));
        assert!(!d.is_allowed());
        assert_eq!(d.remaining(), 0);
        assert_eq!(d.retry_after(), Some(Duration::from_millis(750)));
        assert!(d.to_string().contains("denied"));
    }

    #[test]
    fn degraded_reasons() {
        assert!(DecisionReason::FailOpen.is_degraded());
        assert!(DecisionReason::FailClosed.is_degraded());
        assert!(!DecisionReason::CachedDenial.is_degraded());
    }
}

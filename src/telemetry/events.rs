use std::fmt;
use std::time::Duration;

use crate::client::ClientState;
use crate::decision::DecisionReason;
use crate::policy::Algorithm;

/// Events emitted by the limiter, the store breaker, the resolver, and the
/// client-side limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterEvent {
    /// One evaluation finished.
    Decision(DecisionEvent),
    /// The store could not be consulted and the failure mode decided.
    Fallback(FallbackEvent),
    /// The store circuit breaker changed state.
    Breaker(BreakerEvent),
    /// A new policy snapshot was published.
    PolicyReloaded { version: u64, rules: usize },
    /// The client-side limiter changed state.
    ClientState { from: ClientState, to: ClientState, rate_per_sec: f64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionEvent {
    /// Display form of the client key.
    pub key: String,
    pub algorithm: Algorithm,
    pub allowed: bool,
    pub remaining: u64,
    pub reason: DecisionReason,
    /// Time spent in the evaluation, store round trips included.
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackEvent {
    pub key: String,
    /// `FailOpen` or `FailClosed`.
    pub reason: DecisionReason,
    /// What went wrong: a store error or an expired deadline.
    pub cause: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Opened,
    HalfOpen,
    Closed,
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Decision(d) => write!(
                f,
                "Decision[{} {} {} remaining={} reason={} elapsed={:?}]",
                d.key,
                d.algorithm.as_str(),
                if d.allowed { "allowed" } else { "denied" },
                d.remaining,
                d.reason.as_str(),
                d.elapsed
            ),
            LimiterEvent::Fallback(fb) => {
                write!(f, "Fallback[{} {}: {}]", fb.key, fb.reason.as_str(), fb.cause)
            }
            LimiterEvent::Breaker(b) => write!(f, "Breaker[{b}]"),
            LimiterEvent::PolicyReloaded { version, rules } => {
                write!(f, "PolicyReloaded[version={version} rules={rules}]")
            }
            LimiterEvent::ClientState { from, to, rate_per_sec } => {
                write!(f, "ClientState[{from:?} -> {to:?} rate={rate_per_sec:.3}/s]")
            }
        }
    }
}

impl fmt::Display for BreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerEvent::Opened => write!(f, "opened"),
            BreakerEvent::HalfOpen => write!(f, "half_open"),
            BreakerEvent::Closed => write!(f, "closed"),
        }
    }
}

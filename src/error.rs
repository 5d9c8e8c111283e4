//! Error types for the limiter, the store client, and the middleware.
use std::time::Duration;

use crate::encoder::EncodedDecision;

/// Faults raised by a [`StateStore`](crate::store::StateStore) or the guard around it.
///
/// A key that expired between a read and a write is *not* an error; stores
/// report it as an absent value and the algorithms treat it as a fresh key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The round trip exceeded the configured operation timeout.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// The backing store could not be reached.
    #[error("store connection lost: {0}")]
    ConnectionLost(String),
    /// The breaker guarding the store is open; the call was not attempted.
    #[error("store circuit open ({failure_count} failures, open for {open_for:?})")]
    CircuitOpen {
        /// Consecutive failures that tripped the breaker.
        failure_count: usize,
        /// How long the breaker has been open.
        open_for: Duration,
    },
    /// A stored value could not be decoded.
    #[error("corrupt value under key '{key}': {reason}")]
    Corrupt {
        /// Store key holding the bad value.
        key: String,
        /// Decoder message.
        reason: String,
    },
}

impl StoreError {
    /// Whether the fault is transient infrastructure trouble that counts
    /// against the breaker.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ConnectionLost(_))
    }
}

/// Errors surfaced by policy loading and evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LimitError {
    /// Capacity or window is non-positive, or a rule is otherwise unusable.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    /// No rule matched and no default rule is configured.
    #[error("no policy found for client '{client_id}' on endpoint '{endpoint}'")]
    NoPolicyFound {
        /// Client identifier that was resolved.
        client_id: String,
        /// Endpoint class that was resolved.
        endpoint: String,
    },
    /// The configuration source could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
    /// Store fault that escaped the fallback path.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error returned by [`RateLimitService`](crate::middleware::RateLimitService).
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError<E> {
    /// The request was denied; carries the encoded `429` response parts.
    #[error("rate limit exceeded (retry after {}s)", .0.retry_after_secs().unwrap_or(0))]
    Limited(Box<EncodedDecision>),
    /// The policy could not be resolved or was invalid.
    #[error(transparent)]
    Policy(LimitError),
    /// The wrapped service failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> ThrottleError<E> {
    /// Check if this error is a rate-limit denial.
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited(_))
    }

    /// Borrow the encoded denial if present.
    pub fn as_limited(&self) -> Option<&EncodedDecision> {
        match self {
            Self::Limited(encoded) => Some(encoded),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn store_timeout_display() {
        let err = StoreError::Timeout(Duration::from_millis(25));
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("25"));
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Timeout(Duration::from_millis(1)).is_transient());
        assert!(StoreError::ConnectionLost("reset".into()).is_transient());
        assert!(!StoreError::CircuitOpen { failure_count: 3, open_for: Duration::ZERO }
            .is_transient());
        assert!(!StoreError::Corrupt { key: "k".into(), reason: "bad".into() }.is_transient());
    }

    #[test]
    fn no_policy_display_names_identity() {
        let err = LimitError::NoPolicyFound { client_id: "acme".into(), endpoint: "search".into() };
        let msg = err.to_string();
        assert!(msg.contains("acme"));
        assert!(msg.contains("search"));
    }

    #[test]
    fn store_error_converts_into_limit_error() {
        let err: LimitError = StoreError::ConnectionLost("refused".into()).into();
        assert!(matches!(err, LimitError::Store(StoreError::ConnectionLost(_))));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn throttle_inner_round_trips() {
        let err: ThrottleError<io::Error> = ThrottleError::Inner(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!err.is_limited());
        assert!(err.as_limited().is_none());
        assert_eq!(err.into_inner().map(|e| e.to_string()), Some("boom".to_string()));
    }
}

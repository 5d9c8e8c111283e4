//! Convenient re-exports for common Tollgate types.
pub use crate::{
    client::{AdaptiveClientLimiter, ClientLimiterConfig, Feedback},
    decision::{Decision, DecisionReason},
    encoder::{encode, EncodedDecision},
    key::ClientKey,
    limiter::{LimiterOptions, RateLimiter},
    middleware::{identity_from_headers, RateLimitLayer, RequestIdentity},
    policy::{Algorithm, FailureMode, LimitPolicy, MatchCriteria, PolicyConfig, StalenessBias},
    resolver::PolicyResolver,
    store::{InMemoryStore, StateStore},
    LimitError, StoreError, ThrottleError,
};

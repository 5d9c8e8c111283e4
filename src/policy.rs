//! Limit policies and the configuration file model they are loaded from.
//!
//! A [`LimitPolicy`] is the validated, request-time form: algorithm plus its
//! numeric parameters. A [`PolicyRule`] is the on-disk form: match criteria plus
//! the same parameters, some optional. [`PolicyConfig`] is the list of rules a
//! [`PolicyResolver`](crate::resolver::PolicyResolver) is built from.
//!
//! Config shape (JSON):
//!
//! ```json
//! { "rules": [
//!     { "match": {}, "algorithm": "token_bucket", "capacity": 100, "refill_per_sec": 10.0 },
//!     { "match": { "endpoint": "search", "tier": "free" },
//!       "algorithm": "sliding_window_log", "capacity": 30, "window_ms": 60000 }
//! ] }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::LimitError;

const DEFAULT_COUNTER_BUCKETS: u32 = 10;

/// Admission algorithm selected by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Tokens refill at a constant rate up to capacity; allows bursts.
    TokenBucket,
    /// Bounded virtual queue drained at a constant rate; smooths output.
    LeakyBucket,
    /// One counter per epoch-aligned window.
    FixedWindow,
    /// Exact trailing window over accepted-request timestamps.
    SlidingWindowLog,
    /// Weighted sum over sub-window counters.
    SlidingWindowCounter,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindowLog => "sliding_window_log",
            Algorithm::SlidingWindowCounter => "sliding_window_counter",
        }
    }

    fn is_rate_based(self) -> bool {
        matches!(self, Algorithm::TokenBucket | Algorithm::LeakyBucket)
    }
}

/// What the limiter answers when the shared store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit everything while the store is unavailable.
    #[default]
    FailOpen,
    /// Deny everything while the store is unavailable.
    FailClosed,
}

/// Which way local, possibly stale, state may err.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessBias {
    /// Local deny cache is consulted; a cached denial short-circuits the store.
    Deny,
    /// Local state is never used to answer; every decision goes to the store.
    Allow,
}

impl From<FailureMode> for StalenessBias {
    fn from(mode: FailureMode) -> Self {
        match mode {
            FailureMode::FailOpen => StalenessBias::Allow,
            FailureMode::FailClosed => StalenessBias::Deny,
        }
    }
}

/// Validated limit configuration for one class of requests.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitPolicy {
    algorithm: Algorithm,
    capacity: u64,
    window: Duration,
    refill_per_sec: f64,
    buckets: u32,
    burst_allowance: u64,
    failure_mode: FailureMode,
    charge_denied: bool,
    bias: Option<StalenessBias>,
}

impl LimitPolicy {
    fn base(algorithm: Algorithm, capacity: u64, window: Duration, refill_per_sec: f64) -> Self {
        Self {
            algorithm,
            capacity,
            window,
            refill_per_sec,
            buckets: DEFAULT_COUNTER_BUCKETS,
            burst_allowance: 0,
            failure_mode: FailureMode::default(),
            charge_denied: false,
            bias: None,
        }
    }

    /// Token bucket holding `capacity` tokens, refilled at `refill_per_sec`.
    ///
    /// The reported window is the time to refill an empty bucket.
    pub fn token_bucket(capacity: u64, refill_per_sec: f64) -> Self {
        Self::base(Algorithm::TokenBucket, capacity, full_refill(capacity, refill_per_sec), refill_per_sec)
    }

    /// Leaky bucket with a queue of `capacity`, drained at `leak_per_sec`.
    pub fn leaky_bucket(capacity: u64, leak_per_sec: f64) -> Self {
        Self::base(Algorithm::LeakyBucket, capacity, full_refill(capacity, leak_per_sec), leak_per_sec)
    }

    /// `limit` requests per epoch-aligned `window`.
    pub fn fixed_window(limit: u64, window: Duration) -> Self {
        Self::base(Algorithm::FixedWindow, limit, window, rate_of(limit, window))
    }

    /// `limit` requests in any trailing `window`, exact.
    pub fn sliding_window_log(limit: u64, window: Duration) -> Self {
        Self::base(Algorithm::SlidingWindowLog, limit, window, rate_of(limit, window))
    }

    /// `limit` requests in any trailing `window`, approximated over `buckets` sub-windows.
    pub fn sliding_window_counter(limit: u64, window: Duration, buckets: u32) -> Self {
        let mut policy =
            Self::base(Algorithm::SlidingWindowCounter, limit, window, rate_of(limit, window));
        policy.buckets = buckets;
        policy
    }

    /// Extra admits on top of `capacity`.
    pub fn with_burst_allowance(mut self, burst: u64) -> Self {
        self.burst_allowance = burst;
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Whether denied requests count against a fixed-window limit. Off by
    /// default; the sliding-window counter never charges denials.
    pub fn with_charge_denied(mut self, charge: bool) -> Self {
        self.charge_denied = charge;
        self
    }

    pub fn with_bias(mut self, bias: StalenessBias) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Configured capacity, without burst allowance.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Capacity plus burst allowance; the number reported as the limit.
    pub fn effective_capacity(&self) -> u64 {
        self.capacity.saturating_add(self.burst_allowance)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in whole milliseconds.
    pub fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    /// Refill (token bucket) or leak (leaky bucket) rate per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    pub fn buckets(&self) -> u32 {
        self.buckets
    }

    pub fn burst_allowance(&self) -> u64 {
        self.burst_allowance
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub fn charge_denied(&self) -> bool {
        self.charge_denied
    }

    /// Explicit bias, or the one implied by the failure mode.
    pub fn bias(&self) -> StalenessBias {
        self.bias.unwrap_or_else(|| self.failure_mode.into())
    }

    /// Reject non-positive capacity or window and unusable rates.
    pub fn validate(&self) -> Result<(), LimitError> {
        if self.capacity == 0 {
            return Err(LimitError::InvalidPolicy(format!(
                "{}: capacity must be > 0",
                self.algorithm.as_str()
            )));
        }
        if self.window.is_zero() {
            return Err(LimitError::InvalidPolicy(format!(
                "{}: window must be > 0",
                self.algorithm.as_str()
            )));
        }
        if self.algorithm.is_rate_based()
            && !(self.refill_per_sec.is_finite() && self.refill_per_sec > 0.0)
        {
            return Err(LimitError::InvalidPolicy(format!(
                "{}: rate must be finite and > 0 (got {})",
                self.algorithm.as_str(),
                self.refill_per_sec
            )));
        }
        if self.algorithm == Algorithm::SlidingWindowCounter {
            if self.buckets == 0 {
                return Err(LimitError::InvalidPolicy(
                    "sliding_window_counter: buckets must be > 0".into(),
                ));
            }
            if self.window_millis() < u64::from(self.buckets) {
                return Err(LimitError::InvalidPolicy(format!(
                    "sliding_window_counter: window of {}ms cannot hold {} buckets",
                    self.window_millis(),
                    self.buckets
                )));
            }
            // A charged denial would feed the weighted estimate and keep a
            // saturating client locked out.
            if self.charge_denied {
                return Err(LimitError::InvalidPolicy(
                    "sliding_window_counter: charge_denied is only supported by fixed_window".into(),
                ));
            }
        }
        Ok(())
    }
}

fn full_refill(capacity: u64, rate: f64) -> Duration {
    if rate.is_finite() && rate > 0.0 {
        let secs = capacity as f64 / rate;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX).max(Duration::from_millis(1))
    } else {
        Duration::ZERO
    }
}

fn rate_of(limit: u64, window: Duration) -> f64 {
    if window.is_zero() {
        0.0
    } else {
        limit as f64 / window.as_secs_f64()
    }
}

/// Which requests a rule applies to. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl MatchCriteria {
    /// The global default: matches every request.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn client_endpoint(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self { client_id: Some(client_id.into()), endpoint: Some(endpoint.into()), tier: None }
    }

    pub fn tier_endpoint(tier: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self { client_id: None, endpoint: Some(endpoint.into()), tier: Some(tier.into()) }
    }

    pub fn endpoint(endpoint: impl Into<String>) -> Self {
        Self { client_id: None, endpoint: Some(endpoint.into()), tier: None }
    }

    pub fn is_default(&self) -> bool {
        self.client_id.is_none() && self.endpoint.is_none() && self.tier.is_none()
    }

    /// Ordering weight: client beats tier beats endpoint, and combinations
    /// beat their parts. client+endpoint (5) > tier+endpoint (3) > endpoint (1) > default (0).
    pub fn specificity(&self) -> u8 {
        let mut score = 0;
        if self.client_id.is_some() {
            score += 4;
        }
        if self.tier.is_some() {
            score += 2;
        }
        if self.endpoint.is_some() {
            score += 1;
        }
        score
    }

    pub fn matches(&self, client_id: &str, endpoint: &str, tier: Option<&str>) -> bool {
        self.client_id.as_deref().map_or(true, |c| c == client_id)
            && self.endpoint.as_deref().map_or(true, |e| e == endpoint)
            && self.tier.as_deref().map_or(true, |t| tier == Some(t))
    }
}

/// One entry of the policy file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    #[serde(rename = "match", default)]
    pub criteria: MatchCriteria,
    pub algorithm: Algorithm,
    pub capacity: u64,
    /// Window length; required for window algorithms, derived for bucket algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    /// Refill/leak rate; required for bucket algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<u32>,
    #[serde(default)]
    pub burst_allowance: u64,
    #[serde(default)]
    pub failure_mode: FailureMode,
    #[serde(default)]
    pub charge_denied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<StalenessBias>,
}

impl PolicyRule {
    /// Build a rule from an already constructed policy.
    pub fn new(criteria: MatchCriteria, policy: &LimitPolicy) -> Self {
        let rate_based = policy.algorithm.is_rate_based();
        Self {
            criteria,
            algorithm: policy.algorithm,
            capacity: policy.capacity,
            window_ms: (!rate_based).then(|| policy.window_millis()),
            refill_per_sec: rate_based.then_some(policy.refill_per_sec),
            buckets: (policy.algorithm == Algorithm::SlidingWindowCounter).then_some(policy.buckets),
            burst_allowance: policy.burst_allowance,
            failure_mode: policy.failure_mode,
            charge_denied: policy.charge_denied,
            bias: policy.bias,
        }
    }

    /// Convert to a validated [`LimitPolicy`].
    pub fn to_policy(&self) -> Result<LimitPolicy, LimitError> {
        let window = self.window_ms.map(Duration::from_millis);
        let mut policy = match self.algorithm {
            Algorithm::TokenBucket | Algorithm::LeakyBucket => {
                let rate = self.refill_per_sec.ok_or_else(|| {
                    LimitError::InvalidPolicy(format!(
                        "{}: refill_per_sec is required",
                        self.algorithm.as_str()
                    ))
                })?;
                let mut policy = if self.algorithm == Algorithm::TokenBucket {
                    LimitPolicy::token_bucket(self.capacity, rate)
                } else {
                    LimitPolicy::leaky_bucket(self.capacity, rate)
                };
                if let Some(window) = window {
                    policy.window = window;
                }
                policy
            }
            algorithm => {
                let window = window.ok_or_else(|| {
                    LimitError::InvalidPolicy(format!("{}: window_ms is required", algorithm.as_str()))
                })?;
                match algorithm {
                    Algorithm::FixedWindow => LimitPolicy::fixed_window(self.capacity, window),
                    Algorithm::SlidingWindowLog => {
                        LimitPolicy::sliding_window_log(self.capacity, window)
                    }
                    _ => LimitPolicy::sliding_window_counter(
                        self.capacity,
                        window,
                        self.buckets.unwrap_or(DEFAULT_COUNTER_BUCKETS),
                    ),
                }
            }
        };
        policy.burst_allowance = self.burst_allowance;
        policy.failure_mode = self.failure_mode;
        policy.charge_denied = self.charge_denied;
        policy.bias = self.bias;
        policy.validate()?;
        Ok(policy)
    }
}

/// The full policy file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub rules: Vec<PolicyRule>,
}

impl PolicyConfig {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Append a rule.
    pub fn with_rule(mut self, criteria: MatchCriteria, policy: &LimitPolicy) -> Self {
        self.rules.push(PolicyRule::new(criteria, policy));
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self, LimitError> {
        serde_json::from_str(raw).map_err(|e| LimitError::Config(e.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LimitError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LimitError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        let err = LimitPolicy::fixed_window(0, Duration::from_secs(1)).validate().unwrap_err();
        assert!(matches!(err, LimitError::InvalidPolicy(msg) if msg.contains("capacity")));
    }

    #[test]
    fn rejects_zero_window() {
        let err = LimitPolicy::sliding_window_log(5, Duration::ZERO).validate().unwrap_err();
        assert!(matches!(err, LimitError::InvalidPolicy(msg) if msg.contains("window")));
    }

    #[test]
    fn rejects_non_positive_rate() {
        assert!(LimitPolicy::token_bucket(5, 0.0).validate().is_err());
        assert!(LimitPolicy::leaky_bucket(5, -1.0).validate().is_err());
        assert!(LimitPolicy::token_bucket(5, f64::NAN).validate().is_err());
    }

    #[test]
    fn rejects_more_buckets_than_millis() {
        let policy = LimitPolicy::sliding_window_counter(5, Duration::from_millis(4), 10);
        assert!(policy.validate().is_err());
        let policy = LimitPolicy::sliding_window_counter(5, Duration::from_millis(10), 0);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn token_bucket_window_is_full_refill_time() {
        let policy = LimitPolicy::token_bucket(5, 1.0);
        assert_eq!(policy.window(), Duration::from_secs(5));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn burst_extends_effective_capacity() {
        let policy = LimitPolicy::token_bucket(10, 1.0).with_burst_allowance(5);
        assert_eq!(policy.capacity(), 10);
        assert_eq!(policy.effective_capacity(), 15);
    }

    #[test]
    fn bias_defaults_from_failure_mode() {
        let open = LimitPolicy::fixed_window(1, Duration::from_secs(1));
        assert_eq!(open.bias(), StalenessBias::Allow);
        let closed = open.clone().with_failure_mode(FailureMode::FailClosed);
        assert_eq!(closed.bias(), StalenessBias::Deny);
        let overridden = closed.with_bias(StalenessBias::Allow);
        assert_eq!(overridden.bias(), StalenessBias::Allow);
    }

    #[test]
    fn specificity_orders_match_levels() {
        let client_endpoint = MatchCriteria::client_endpoint("acme", "search");
        let tier_endpoint = MatchCriteria::tier_endpoint("gold", "search");
        let endpoint = MatchCriteria::endpoint("search");
        let default = MatchCriteria::any();
        assert!(client_endpoint.specificity() > tier_endpoint.specificity());
        assert!(tier_endpoint.specificity() > endpoint.specificity());
        assert!(endpoint.specificity() > default.specificity());
    }

    #[test]
    fn tier_criterion_requires_request_tier() {
        let criteria = MatchCriteria::tier_endpoint("gold", "search");
        assert!(criteria.matches("anyone", "search", Some("gold")));
        assert!(!criteria.matches("anyone", "search", None));
        assert!(!criteria.matches("anyone", "search", Some("free")));
        assert!(!criteria.matches("anyone", "upload", Some("gold")));
    }

    #[test]
    fn parses_config_file_shape() {
        let raw = r#"{
            "rules": [
                { "match": {}, "algorithm": "token_bucket", "capacity": 100, "refill_per_sec": 10.0 },
                { "match": { "endpoint": "search", "tier": "free" },
                  "algorithm": "sliding_window_log", "capacity": 30, "window_ms": 60000,
                  "failure_mode": "fail_closed" },
                { "match": { "endpoint": "upload" },
                  "algorithm": "sliding_window_counter", "capacity": 10, "window_ms": 1000,
                  "buckets": 4, "charge_denied": false, "burst_allowance": 2 }
            ]
        }"#;
        let config = PolicyConfig::from_json_str(raw).expect("valid config");
        assert_eq!(config.rules.len(), 3);

        let default = config.rules[0].to_policy().unwrap();
        assert_eq!(default.algorithm(), Algorithm::TokenBucket);
        assert_eq!(default.window(), Duration::from_secs(10));

        let strict = config.rules[1].to_policy().unwrap();
        assert_eq!(strict.failure_mode(), FailureMode::FailClosed);
        assert_eq!(strict.bias(), StalenessBias::Deny);
        assert!(!strict.charge_denied());

        let counter = config.rules[2].to_policy().unwrap();
        assert_eq!(counter.buckets(), 4);
        assert!(!counter.charge_denied());
        assert_eq!(counter.effective_capacity(), 12);
    }

    #[test]
    fn window_algorithms_require_window() {
        let raw = r#"{ "rules": [ { "algorithm": "fixed_window", "capacity": 5 } ] }"#;
        let config = PolicyConfig::from_json_str(raw).unwrap();
        let err = config.rules[0].to_policy().unwrap_err();
        assert!(matches!(err, LimitError::InvalidPolicy(msg) if msg.contains("window_ms")));
    }

    #[test]
    fn unknown_fields_are_config_errors() {
        let raw = r#"{ "rules": [ { "algorithm": "fixed_window", "capacity": 5, "windw_ms": 10 } ] }"#;
        assert!(matches!(PolicyConfig::from_json_str(raw), Err(LimitError::Config(_))));
    }

    #[test]
    fn charging_denials_is_fixed_window_only() {
        assert!(!LimitPolicy::fixed_window(5, Duration::from_secs(1)).charge_denied());
        assert!(LimitPolicy::fixed_window(5, Duration::from_secs(1))
            .with_charge_denied(true)
            .validate()
            .is_ok());
        let counter = LimitPolicy::sliding_window_counter(5, Duration::from_secs(1), 4);
        assert!(!counter.charge_denied());
        let err = counter.with_charge_denied(true).validate().unwrap_err();
        assert!(matches!(err, LimitError::InvalidPolicy(msg) if msg.contains("charge_denied")));
    }

    #[test]
    fn rule_round_trips_through_policy() {
        let policy = LimitPolicy::sliding_window_counter(20, Duration::from_secs(60), 6)
            .with_failure_mode(FailureMode::FailClosed)
            .with_charge_denied(false);
        let rule = PolicyRule::new(MatchCriteria::endpoint("search"), &policy);
        assert_eq!(rule.to_policy().unwrap(), policy);
    }
}

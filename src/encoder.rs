//! Decision encoder: the external contract every algorithm shares.
//!
//! | Header | Value |
//! |---|---|
//! | `X-RateLimit-Limit` | effective capacity of the policy |
//! | `X-RateLimit-Remaining` | estimated admits left |
//! | `X-RateLimit-Reset` | Unix seconds at which `remaining` can next grow |
//! | `Retry-After` | seconds to wait, denials only |
//!
//! Denials are `429 Too Many Requests` with a JSON body:
//! `{"error_code":"RATE_LIMIT_EXCEEDED","limit":..,"window":..,"retry_after":..}`.
//! Admits pass the downstream status through and only add headers.
//!
//! Nothing here depends on the algorithm, so the headers do not reveal
//! which one is configured. Times round up: retrying at the advertised
//! instant never lands a few milliseconds early.

use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::policy::LimitPolicy;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Error code carried in every `429` body.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Machine-readable `429` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBody {
    pub error_code: String,
    pub limit: u64,
    /// Policy window in seconds.
    pub window: u64,
    /// Seconds to wait before retrying.
    pub retry_after: u64,
}

/// A decision rendered into HTTP terms.
#[derive(Debug, Clone)]
pub struct EncodedDecision {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<RateLimitBody>,
}

impl EncodedDecision {
    /// `200 OK` for admits (meaning "pass through"), `429` for denials.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&RateLimitBody> {
        self.body.as_ref()
    }

    /// `Retry-After` in seconds, present on denials.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.body.as_ref().map(|b| b.retry_after)
    }

    /// The denial body as JSON.
    pub fn body_json(&self) -> Option<String> {
        self.body.as_ref().and_then(|b| serde_json::to_string(b).ok())
    }

    /// A complete response: headers plus the JSON body on denial.
    pub fn into_response(self) -> Response<String> {
        let body = self.body_json().unwrap_or_default();
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        if self.body.is_some() {
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        response.headers_mut().extend(self.headers);
        response
    }

    /// Copy the rate-limit headers onto a downstream response, keeping its status.
    pub fn apply_to<B>(&self, response: &mut Response<B>) {
        for (name, value) in &self.headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
}

/// Render `decision` for a request governed by `policy`.
pub fn encode(decision: &Decision, policy: &LimitPolicy) -> EncodedDecision {
    let mut headers = HeaderMap::with_capacity(4);
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining()));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(ceil_secs(decision.reset_at_millis())));

    if decision.is_allowed() {
        return EncodedDecision { status: StatusCode::OK, headers, body: None };
    }

    let retry_ms = decision
        .retry_after()
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    let retry_after = ceil_secs(retry_ms).max(1);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));

    let body = RateLimitBody {
        error_code: RATE_LIMIT_EXCEEDED.to_string(),
        limit: decision.limit(),
        window: ceil_secs(policy.window_millis()),
        retry_after,
    };
    EncodedDecision { status: StatusCode::TOO_MANY_REQUESTS, headers, body: Some(body) }
}

fn ceil_secs(millis: u64) -> u64 {
    millis / 1000 + u64::from(millis % 1000 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn header(encoded: &EncodedDecision, name: &str) -> String {
        encoded.headers().get(name).unwrap().to_str().unwrap().to_string()
    }

    #[test]
    fn allow_carries_headers_without_retry() {
        let policy = LimitPolicy::token_bucket(10, 1.0);
        let encoded = encode(&Decision::allow(10, 7, 1_700_000_000_500), &policy);
        assert_eq!(encoded.status(), StatusCode::OK);
        assert_eq!(header(&encoded, "x-ratelimit-limit"), "10");
        assert_eq!(header(&encoded, "x-ratelimit-remaining"), "7");
        assert_eq!(header(&encoded, "x-ratelimit-reset"), "1700000001");
        assert!(encoded.headers().get(RETRY_AFTER).is_none());
        assert!(encoded.body().is_none());
    }

    #[test]
    fn deny_is_429_with_body() {
        let policy = LimitPolicy::fixed_window(100, Duration::from_secs(60));
        let decision = Decision::deny(100, 30_000, Duration::from_millis(1_200));
        let encoded = encode(&decision, &policy);
        assert!(encoded.is_limited());
        assert_eq!(header(&encoded, "retry-after"), "2");
        let body = encoded.body().unwrap();
        assert_eq!(body.error_code, "RATE_LIMIT_EXCEEDED");
        assert_eq!(body.window, 60);
        assert_eq!(body.retry_after, 2);
    }

    #[test]
    fn sub_second_retry_rounds_up_to_one() {
        let policy = LimitPolicy::token_bucket(1, 10.0);
        let encoded = encode(&Decision::deny(1, 100, Duration::from_millis(100)), &policy);
        assert_eq!(encoded.retry_after_secs(), Some(1));
    }

    #[test]
    fn response_has_json_body() {
        let policy = LimitPolicy::sliding_window_log(3, Duration::from_secs(60));
        let response = encode(&Decision::deny(3, 60_001, Duration::from_millis(30_001)), &policy)
            .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["retry_after"], 31);
        assert_eq!(body["limit"], 3);
    }

    #[test]
    fn apply_keeps_downstream_status() {
        let policy = LimitPolicy::token_bucket(5, 1.0);
        let encoded = encode(&Decision::allow(5, 4, 1_000), &policy);
        let mut response = Response::builder().status(StatusCode::CREATED).body(()).unwrap();
        encoded.apply_to(&mut response);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "4");
    }

    #[test]
    fn header_contract_is_algorithm_agnostic() {
        let decision = Decision::deny(5, 2_000, Duration::from_millis(1_000));
        let a = encode(&decision, &LimitPolicy::token_bucket(5, 5.0));
        let b = encode(&decision, &LimitPolicy::sliding_window_counter(5, Duration::from_secs(1), 4));
        assert_eq!(a.headers(), b.headers());
    }
}

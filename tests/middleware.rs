use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response, StatusCode};
use tollgate::middleware::{identity_from_headers, CLIENT_ID_HEADER, CLIENT_TIER_HEADER};
use tollgate::telemetry::{LimiterEvent, MemorySink};
use tollgate::{
    FaultyStore, InMemoryStore, ManualClock, PolicyConfig, PolicyResolver, RateLimitLayer,
    RateLimiter, RequestIdentity, ThrottleError,
};
use tower::{service_fn, ServiceBuilder, ServiceExt};

type Extractor = fn(&Request<()>) -> RequestIdentity;

const POLICIES: &str = r#"{
    "rules": [
        { "match": {}, "algorithm": "token_bucket", "capacity": 100, "refill_per_sec": 10.0 },
        { "match": { "endpoint": "/search", "tier": "free" },
          "algorithm": "fixed_window", "capacity": 2, "window_ms": 60000 },
        { "match": { "endpoint": "/report" },
          "algorithm": "sliding_window_log", "capacity": 5, "window_ms": 1000,
          "failure_mode": "fail_closed" }
    ]
}"#;

fn resolver() -> PolicyResolver {
    PolicyResolver::new(&PolicyConfig::from_json_str(POLICIES).unwrap()).unwrap()
}

fn request(path: &str, client: &str, tier: Option<&str>) -> Request<()> {
    let mut builder = Request::builder().uri(path).header(CLIENT_ID_HEADER, client);
    if let Some(tier) = tier {
        builder = builder.header(CLIENT_TIER_HEADER, tier);
    }
    builder.body(()).unwrap()
}

async fn ok(_req: Request<()>) -> Result<Response<String>, Infallible> {
    Ok(Response::new("ok".to_string()))
}

#[tokio::test]
async fn tier_policy_limits_free_clients_only() {
    let limiter = Arc::new(RateLimiter::new(Arc::new(InMemoryStore::new())));
    let layer = RateLimitLayer::new(limiter, resolver(), identity_from_headers::<()> as Extractor)
        .with_clock(ManualClock::starting_at(120_000));
    let svc = ServiceBuilder::new().layer(layer).service(service_fn(ok));

    for _ in 0..2 {
        let response = svc.clone().oneshot(request("/search", "acme", Some("free"))).await.unwrap();
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
    }
    let err = svc.clone().oneshot(request("/search", "acme", Some("free"))).await.unwrap_err();
    assert!(err.is_limited());
    let rejection = match err {
        ThrottleError::Limited(encoded) => (*encoded).into_response(),
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(rejection.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejection.headers()["retry-after"], "60");
    assert_eq!(rejection.headers()["x-ratelimit-reset"], "180");
    assert_eq!(rejection.headers()["content-type"], "application/json");
    let body: serde_json::Value = serde_json::from_str(rejection.body()).unwrap();
    assert_eq!(body["limit"], 2);

    // Gold tier on the same endpoint falls through to the default bucket.
    let gold = svc.oneshot(request("/search", "acme", Some("gold"))).await.unwrap();
    assert_eq!(gold.headers()["x-ratelimit-limit"], "100");
}

#[tokio::test]
async fn outage_applies_per_policy_failure_mode() {
    let store = FaultyStore::new(InMemoryStore::new());
    store.set_unavailable(true);
    let sink = MemorySink::new();
    let limiter = Arc::new(RateLimiter::new(Arc::new(store.clone())).with_sink(sink.clone()));
    let layer = RateLimitLayer::new(limiter, resolver(), identity_from_headers::<()> as Extractor)
        .with_clock(ManualClock::starting_at(5_000));
    let svc = ServiceBuilder::new().layer(layer).service(service_fn(ok));

    // Default policy fails open.
    let open = svc.clone().oneshot(request("/search", "acme", None)).await.unwrap();
    assert_eq!(open.status(), StatusCode::OK);
    assert_eq!(open.headers()["x-ratelimit-remaining"], "0");

    // /report fails closed.
    let closed = svc.oneshot(request("/report", "acme", None)).await.unwrap_err();
    assert_eq!(closed.as_limited().unwrap().retry_after_secs(), Some(1));

    let fallbacks = sink.events().into_iter().filter(|e| matches!(e, LimiterEvent::Fallback(_))).count();
    assert_eq!(fallbacks, 2);
}

#[tokio::test(start_paused = true)]
async fn slow_store_hits_request_deadline() {
    let store = FaultyStore::new(InMemoryStore::new());
    store.set_latency(Duration::from_millis(500));
    let limiter = Arc::new(RateLimiter::new(Arc::new(store)));
    let layer = RateLimitLayer::new(limiter, resolver(), identity_from_headers::<()> as Extractor)
        .with_clock(ManualClock::starting_at(5_000))
        .with_deadline(Duration::from_millis(10));
    let svc = ServiceBuilder::new().layer(layer).service(service_fn(ok));

    let open = svc.clone().oneshot(request("/search", "acme", None)).await.unwrap();
    assert_eq!(open.status(), StatusCode::OK);
    let closed = svc.oneshot(request("/report", "acme", None)).await.unwrap_err();
    assert!(closed.is_limited());
}

#[tokio::test]
async fn inner_errors_pass_through() {
    let limiter = Arc::new(RateLimiter::new(Arc::new(InMemoryStore::new())));
    let layer = RateLimitLayer::new(limiter, resolver(), identity_from_headers::<()> as Extractor)
        .with_clock(ManualClock::starting_at(0));
    let svc = ServiceBuilder::new()
        .layer(layer)
        .service(service_fn(|_req: Request<()>| async { Err::<Response<String>, _>("boom") }));

    let err = svc.oneshot(request("/search", "acme", None)).await.unwrap_err();
    assert!(!err.is_limited());
    assert_eq!(err.into_inner(), Some("boom"));
}

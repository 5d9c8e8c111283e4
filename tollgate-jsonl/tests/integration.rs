use std::sync::Arc;

use tollgate::telemetry::{BreakerEvent, LimiterEvent};
use tollgate::{ClientKey, InMemoryStore, LimitPolicy, RateLimiter};
use tollgate_jsonl::JsonlSink;
use tower_service::Service;

fn lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .expect("file")
        .lines()
        .map(|l| serde_json::from_str(l).expect("one json object per line"))
        .collect()
}

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let mut sink = JsonlSink::new(path.to_string_lossy().to_string());

    sink.call(LimiterEvent::Breaker(BreakerEvent::Opened)).await.unwrap();
    sink.call(LimiterEvent::PolicyReloaded { version: 2, rules: 4 }).await.unwrap();

    let events = lines(&path);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["kind"], "breaker_opened");
    assert_eq!(events[1]["version"], 2);
}

#[tokio::test]
async fn limiter_decisions_land_in_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decisions.jsonl");
    let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()))
        .with_sink(JsonlSink::new(path.to_string_lossy().to_string()));
    let key = ClientKey::new("acme", "search");
    let policy = LimitPolicy::token_bucket(1, 1.0);

    limiter.evaluate(&key, &policy, 0).await.unwrap();
    limiter.evaluate(&key, &policy, 0).await.unwrap();

    let events = lines(&path);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["kind"], "decision");
    assert_eq!(events[0]["key"], "acme@search");
    assert_eq!(events[0]["allowed"], true);
    assert_eq!(events[1]["allowed"], false);
    assert_eq!(events[1]["algorithm"], "token_bucket");
}

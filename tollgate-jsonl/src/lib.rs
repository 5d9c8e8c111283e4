//! JSONL sink for `tollgate`. Writes one event per line.
//! Always appends; bring your own path and rotation.

use serde_json::json;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tollgate::telemetry::{BreakerEvent, LimiterEvent, TelemetrySink};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: String,
}

impl JsonlSink {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl tower_service::Service<LimiterEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            if let Err(e) = file.write_all(line.as_bytes()).await {
                tracing::debug!(path = %path, error = %e, "jsonl sink write failed");
                return Err(e);
            }
            file.flush().await?;
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}

/// Flat JSON form of an event; `kind` names the variant.
pub fn event_to_json(event: &LimiterEvent) -> serde_json::Value {
    match event {
        LimiterEvent::Decision(d) => json!({
            "kind": "decision",
            "key": d.key,
            "algorithm": d.algorithm.as_str(),
            "allowed": d.allowed,
            "remaining": d.remaining,
            "reason": d.reason.as_str(),
            "elapsed_us": u64::try_from(d.elapsed.as_micros()).unwrap_or(u64::MAX),
        }),
        LimiterEvent::Fallback(fb) => json!({
            "kind": "fallback",
            "key": fb.key,
            "reason": fb.reason.as_str(),
            "cause": fb.cause,
        }),
        LimiterEvent::Breaker(b) => {
            let kind = match b {
                BreakerEvent::Opened => "breaker_opened",
                BreakerEvent::HalfOpen => "breaker_half_open",
                BreakerEvent::Closed => "breaker_closed",
            };
            json!({ "kind": kind })
        }
        LimiterEvent::PolicyReloaded { version, rules } => {
            json!({ "kind": "policy_reloaded", "version": version, "rules": rules })
        }
        LimiterEvent::ClientState { from, to, rate_per_sec } => json!({
            "kind": "client_state",
            "from": format!("{from:?}"),
            "to": format!("{to:?}"),
            "rate_per_sec": rate_per_sec,
        }),
    }
}

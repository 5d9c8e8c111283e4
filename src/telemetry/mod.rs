//! Limiter telemetry.
//!
//! Components emit [`LimiterEvent`]s into a sink. A sink is a
//! `tower::Service<LimiterEvent>`, so sinks compose with ordinary tower
//! combinators and companion crates (such as `tollgate-jsonl`) can ship new ones.
//!
//! Emission is best effort: a slow or failing sink loses events and never
//! delays a rate-limit decision. Wrap an expensive sink in
//! [`NonBlockingSink`] to move its work off the request path.

pub mod events;
pub mod sinks;

pub use events::{BreakerEvent, DecisionEvent, FallbackEvent, LimiterEvent};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NonBlockingSink, NullSink, TelemetrySink};

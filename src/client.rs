//! Client-side adaptive limiter: paces outbound calls and backs off when the
//! server answers `429`.
//!
//! States:
//! - `Normal`: sending at the configured ceiling.
//! - `BackedOff`: any `429` multiplies the rate by `backoff_factor` (down to
//!   `floor_per_sec`). Repeated `429`s keep cutting.
//! - `Recovering`: an adjustment interval passed without a `429`, but the
//!   success rate stayed under the high-water mark; the rate grows by
//!   `additive_step` per interval.
//!
//! At the end of each adjustment interval a success rate at or above
//! `high_water_mark` returns the limiter to `Normal` at the ceiling.
//!
//! This is advisory. It lowers pressure on the server-side limiter and
//! never replaces it.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use http::StatusCode;
use rand::{rng, Rng};

use crate::clock::{Clock, MonotonicClock};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit_best_effort, LimiterEvent, NullSink, TelemetrySink};
use crate::LimitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Normal,
    BackedOff,
    Recovering,
}

/// Outcome of one outbound call, as far as pacing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Success,
    /// The server rate-limited the call; honors `Retry-After` when present.
    Throttled { retry_after: Option<Duration> },
    /// Any other failure. Counts against the success rate but does not back off.
    Failure,
}

impl Feedback {
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            Feedback::Throttled { retry_after }
        } else if status.is_success() || status.is_redirection() || status.is_informational() {
            Feedback::Success
        } else {
            Feedback::Failure
        }
    }

    /// Classify a response, reading `Retry-After` as whole seconds.
    pub fn from_response<B>(response: &http::Response<B>) -> Self {
        let retry_after = response
            .headers()
            .get(http::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        Self::from_status(response.status(), retry_after)
    }
}

/// Tuning for [`AdaptiveClientLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientLimiterConfig {
    pub ceiling_per_sec: f64,
    pub floor_per_sec: f64,
    /// Multiplier applied on each `429`, in `(0, 1)`.
    pub backoff_factor: f64,
    /// Rate added per clean interval while recovering.
    pub additive_step: f64,
    pub adjustment_interval: Duration,
    /// Success rate in `(0, 1]` that restores `Normal`.
    pub high_water_mark: f64,
    /// Sends that may go out back to back.
    pub burst: f64,
    /// Extra random wait, as a fraction of the computed wait, added when pacing.
    pub jitter_ratio: f64,
}

impl ClientLimiterConfig {
    pub fn new(ceiling_per_sec: f64) -> Self {
        Self {
            ceiling_per_sec,
            floor_per_sec: (ceiling_per_sec / 100.0).max(f64::MIN_POSITIVE),
            backoff_factor: 0.5,
            additive_step: (ceiling_per_sec / 10.0).max(f64::MIN_POSITIVE),
            adjustment_interval: Duration::from_secs(1),
            high_water_mark: 0.95,
            burst: 1.0,
            jitter_ratio: 0.1,
        }
    }

    pub fn with_floor(mut self, floor_per_sec: f64) -> Self {
        self.floor_per_sec = floor_per_sec;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_additive_step(mut self, step: f64) -> Self {
        self.additive_step = step;
        self
    }

    pub fn with_adjustment_interval(mut self, interval: Duration) -> Self {
        self.adjustment_interval = interval;
        self
    }

    pub fn with_high_water_mark(mut self, mark: f64) -> Self {
        self.high_water_mark = mark;
        self
    }

    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        let invalid = |what: &str| Err(LimitError::Config(format!("client limiter: {what}")));
        if !positive(self.ceiling_per_sec) {
            return invalid("ceiling_per_sec must be finite and > 0");
        }
        if !positive(self.floor_per_sec) || self.floor_per_sec > self.ceiling_per_sec {
            return invalid("floor_per_sec must be in (0, ceiling_per_sec]");
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            return invalid("backoff_factor must be in (0, 1)");
        }
        if !positive(self.additive_step) {
            return invalid("additive_step must be finite and > 0");
        }
        if self.adjustment_interval.is_zero() {
            return invalid("adjustment_interval must be > 0");
        }
        if !(self.high_water_mark > 0.0 && self.high_water_mark <= 1.0) {
            return invalid("high_water_mark must be in (0, 1]");
        }
        if !(self.burst.is_finite() && self.burst >= 1.0) {
            return invalid("burst must be >= 1");
        }
        if !(self.jitter_ratio.is_finite() && self.jitter_ratio >= 0.0) {
            return invalid("jitter_ratio must be >= 0");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Pacer {
    state: ClientState,
    rate: f64,
    tokens: f64,
    last_refill_ms: u64,
    blocked_until_ms: u64,
    interval_start_ms: u64,
    successes: u64,
    total: u64,
    throttles: u64,
}

impl Pacer {
    fn refill(&mut self, now: u64, burst: f64) {
        if now > self.last_refill_ms {
            let elapsed = (now - self.last_refill_ms) as f64 / 1000.0;
            self.tokens = (self.tokens + elapsed * self.rate).min(burst);
            self.last_refill_ms = now;
        }
    }

    fn reset_interval(&mut self, now: u64) {
        self.interval_start_ms = now;
        self.successes = 0;
        self.total = 0;
        self.throttles = 0;
    }
}

type Transition = (ClientState, ClientState, f64);

/// Paces outbound calls to an adaptive rate. Share it behind an `Arc`.
#[derive(Debug)]
pub struct AdaptiveClientLimiter<Sink = NullSink> {
    config: ClientLimiterConfig,
    pacer: Mutex<Pacer>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Sink,
}

impl AdaptiveClientLimiter<NullSink> {
    pub fn new(config: ClientLimiterConfig) -> Result<Self, LimitError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let now = clock.now_millis();
        Ok(Self {
            pacer: Mutex::new(Pacer {
                state: ClientState::Normal,
                rate: config.ceiling_per_sec,
                tokens: config.burst,
                last_refill_ms: now,
                blocked_until_ms: 0,
                interval_start_ms: now,
                successes: 0,
                total: 0,
                throttles: 0,
            }),
            config,
            clock,
            sleeper: Arc::new(TokioSleeper),
            sink: NullSink,
        })
    }
}

impl<Sink> AdaptiveClientLimiter<Sink>
where
    Sink: TelemetrySink,
    <Sink as tower::Service<LimiterEvent>>::Future: Send + 'static,
{
    /// Drive pacing and intervals from `clock`; timestamps restart at its `now`.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        let now = clock.now_millis();
        self.clock = Arc::new(clock);
        let pacer = self.pacer.get_mut().unwrap_or_else(|p| p.into_inner());
        pacer.last_refill_ms = now;
        pacer.interval_start_ms = now;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_sink<NewSink: TelemetrySink>(self, sink: NewSink) -> AdaptiveClientLimiter<NewSink> {
        AdaptiveClientLimiter {
            config: self.config,
            pacer: self.pacer,
            clock: self.clock,
            sleeper: self.sleeper,
            sink,
        }
    }

    pub fn config(&self) -> &ClientLimiterConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Pacer> {
        self.pacer.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> ClientState {
        self.lock().state
    }

    /// Current send rate in calls per second.
    pub fn current_rate(&self) -> f64 {
        self.lock().rate
    }

    /// Take a send slot now, or learn how long until one opens.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.clock.now_millis();
        let mut pacer = self.lock();
        if now < pacer.blocked_until_ms {
            return Err(Duration::from_millis(pacer.blocked_until_ms - now));
        }
        pacer.refill(now, self.config.burst);
        if pacer.tokens >= 1.0 {
            pacer.tokens -= 1.0;
            return Ok(());
        }
        let secs = (1.0 - pacer.tokens) / pacer.rate;
        Err(Duration::from_millis((secs * 1000.0).ceil().max(1.0) as u64))
    }

    /// Wait (through the sleeper) until a send slot opens, then take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    let wait = self.jittered(wait);
                    tracing::trace!(wait_ms = wait.as_millis() as u64, "client limiter pacing");
                    self.sleeper.sleep(wait).await;
                }
            }
        }
    }

    fn jittered(&self, wait: Duration) -> Duration {
        let max_extra = (wait.as_millis() as f64 * self.config.jitter_ratio) as u64;
        if max_extra == 0 {
            return wait;
        }
        wait + Duration::from_millis(rng().random_range(0..=max_extra))
    }

    /// Feed the outcome of a call back into the limiter.
    pub async fn record(&self, feedback: Feedback) {
        if let Some((from, to, rate_per_sec)) = self.observe(feedback) {
            emit_best_effort(self.sink.clone(), LimiterEvent::ClientState { from, to, rate_per_sec })
                .await;
        }
    }

    fn observe(&self, feedback: Feedback) -> Option<Transition> {
        let now = self.clock.now_millis();
        let mut pacer = self.lock();
        let before = pacer.state;
        pacer.total += 1;
        match feedback {
            Feedback::Success => pacer.successes += 1,
            Feedback::Failure => {}
            Feedback::Throttled { retry_after } => {
                pacer.refill(now, self.config.burst);
                pacer.throttles += 1;
                pacer.rate = (pacer.rate * self.config.backoff_factor).max(self.config.floor_per_sec);
                // Banked burst must not outrun the reduced rate.
                pacer.tokens = pacer.tokens.min(0.0);
                if let Some(wait) = retry_after {
                    let until = now.saturating_add(u64::try_from(wait.as_millis()).unwrap_or(u64::MAX));
                    pacer.blocked_until_ms = pacer.blocked_until_ms.max(until);
                }
                pacer.state = ClientState::BackedOff;
                // Recovery is judged on traffic after the cut.
                pacer.reset_interval(now);
            }
        }
        self.maybe_adjust(&mut pacer, now);

        let after = pacer.state;
        if before == after {
            return None;
        }
        match after {
            ClientState::BackedOff => {
                tracing::warn!(rate = pacer.rate, "client limiter backed off after 429")
            }
            _ => tracing::info!(from = ?before, to = ?after, rate = pacer.rate, "client limiter state"),
        }
        Some((before, after, pacer.rate))
    }

    fn maybe_adjust(&self, pacer: &mut Pacer, now: u64) {
        let interval = u64::try_from(self.config.adjustment_interval.as_millis()).unwrap_or(u64::MAX);
        if now.saturating_sub(pacer.interval_start_ms) < interval {
            return;
        }
        if pacer.state != ClientState::Normal && pacer.total > 0 && pacer.throttles == 0 {
            let success_rate = pacer.successes as f64 / pacer.total as f64;
            if success_rate >= self.config.high_water_mark {
                pacer.state = ClientState::Normal;
                pacer.rate = self.config.ceiling_per_sec;
            } else {
                pacer.rate = (pacer.rate + self.config.additive_step).min(self.config.ceiling_per_sec);
                pacer.state = if pacer.rate >= self.config.ceiling_per_sec {
                    ClientState::Normal
                } else {
                    ClientState::Recovering
                };
            }
        }
        pacer.reset_interval(now);
    }

    /// Acquire a slot, run `op`, and record its outcome as classified by `classify`.
    pub async fn execute<T, E, Fut, Op, C>(&self, op: Op, classify: C) -> Result<T, E>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&Result<T, E>) -> Feedback,
    {
        self.acquire().await;
        let result = op().await;
        self.record(classify(&result)).await;
        result
    }
}

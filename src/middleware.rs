//! Tower middleware: identify the caller, resolve its policy, evaluate, and
//! either forward the request or reject it with an encoded `429`.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tollgate::middleware::{identity_from_headers, RateLimitLayer};
//! use tollgate::policy::{LimitPolicy, MatchCriteria, PolicyConfig};
//! use tollgate::{InMemoryStore, PolicyResolver, RateLimiter};
//!
//! let config = PolicyConfig::default()
//!     .with_rule(MatchCriteria::any(), &LimitPolicy::token_bucket(100, 10.0));
//! let resolver = PolicyResolver::new(&config).unwrap();
//! let limiter = Arc::new(RateLimiter::new(Arc::new(InMemoryStore::new())));
//! let layer = RateLimitLayer::new(limiter, resolver, identity_from_headers::<String>);
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tower_layer::Layer;
use tower_service::Service;

use crate::clock::{Clock, SystemClock};
use crate::encoder::{encode, EncodedDecision};
use crate::error::ThrottleError;
use crate::key::ClientKey;
use crate::limiter::RateLimiter;
use crate::resolver::PolicyResolver;
use crate::telemetry::{LimiterEvent, NullSink, TelemetrySink};

/// Header carrying the caller's client id for [`identity_from_headers`].
pub const CLIENT_ID_HEADER: &str = "x-client-id";
/// Header carrying the caller's tier for [`identity_from_headers`].
pub const CLIENT_TIER_HEADER: &str = "x-client-tier";
/// Client id used when a request carries none.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Who is calling and what they are calling, as extracted from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub client_id: String,
    pub endpoint: String,
    pub tier: Option<String>,
}

impl RequestIdentity {
    pub fn new(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self { client_id: client_id.into(), endpoint: endpoint.into(), tier: None }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn key(&self) -> ClientKey {
        let key = ClientKey::new(self.client_id.clone(), self.endpoint.clone());
        match &self.tier {
            Some(tier) => key.with_tier(tier.clone()),
            None => key,
        }
    }
}

/// Identity from `x-client-id` / `x-client-tier` headers, endpoint = URI path.
pub fn identity_from_headers<B>(req: &http::Request<B>) -> RequestIdentity {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    RequestIdentity {
        client_id: header(CLIENT_ID_HEADER).unwrap_or_else(|| ANONYMOUS_CLIENT.to_string()),
        endpoint: req.uri().path().to_string(),
        tier: header(CLIENT_TIER_HEADER),
    }
}

/// Responses that can carry rate-limit headers on admit.
pub trait AttachRateLimit {
    fn attach_rate_limit(&mut self, encoded: &EncodedDecision);
}

impl<B> AttachRateLimit for http::Response<B> {
    fn attach_rate_limit(&mut self, encoded: &EncodedDecision) {
        encoded.apply_to(self);
    }
}

/// Layer wrapping services with [`RateLimitService`].
pub struct RateLimitLayer<X, Sink = NullSink> {
    limiter: Arc<RateLimiter<Sink>>,
    resolver: PolicyResolver,
    extractor: Arc<X>,
    clock: Arc<dyn Clock>,
    deadline: Option<Duration>,
}

impl<X, Sink> Clone for RateLimitLayer<X, Sink> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            resolver: self.resolver.clone(),
            extractor: self.extractor.clone(),
            clock: self.clock.clone(),
            deadline: self.deadline,
        }
    }
}

impl<X, Sink> RateLimitLayer<X, Sink> {
    /// `extractor` maps each request to a [`RequestIdentity`].
    pub fn new(limiter: Arc<RateLimiter<Sink>>, resolver: PolicyResolver, extractor: X) -> Self {
        Self {
            limiter,
            resolver,
            extractor: Arc::new(extractor),
            clock: Arc::new(SystemClock),
            deadline: None,
        }
    }

    /// Clock supplying `now` for each evaluation (Unix milliseconds by default).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Bound each evaluation; on expiry the policy's failure mode decides.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl<S, X, Sink> Layer<S> for RateLimitLayer<X, Sink> {
    type Service = RateLimitService<S, X, Sink>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService { inner, layer: self.clone() }
    }
}

/// Middleware service enforcing rate limits ahead of `S`.
pub struct RateLimitService<S, X, Sink = NullSink> {
    inner: S,
    layer: RateLimitLayer<X, Sink>,
}

impl<S: Clone, X, Sink> Clone for RateLimitService<S, X, Sink> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S, X, Sink, Req> Service<Req> for RateLimitService<S, X, Sink>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Response: AttachRateLimit + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    X: Fn(&Req) -> RequestIdentity + Send + Sync + 'static,
    Sink: TelemetrySink,
    <Sink as Service<LimiterEvent>>::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ThrottleError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ThrottleError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let identity = (self.layer.extractor)(&req);
        let limiter = self.layer.limiter.clone();
        let resolver = self.layer.resolver.clone();
        let now = self.layer.clock.now_millis();
        let deadline = self.layer.deadline;
        // Take the instance that was driven ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let key = identity.key();
            let policy = resolver.resolve_key(&key);
            let decision = match deadline {
                Some(deadline) => limiter.evaluate_with_deadline(&key, &policy, now, deadline).await,
                None => limiter.evaluate(&key, &policy, now).await,
            }
            .map_err(ThrottleError::Policy)?;

            let encoded = encode(&decision, &policy);
            if encoded.is_limited() {
                return Err(ThrottleError::Limited(Box::new(encoded)));
            }
            let mut response = inner.call(req).await.map_err(ThrottleError::Inner)?;
            response.attach_rate_limit(&encoded);
            Ok(response)
        })
    }
}

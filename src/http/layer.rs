//! Tower middleware enforcing a [`RateLimiter`] on every request.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tower::{Layer, Service};
use tracing::{error, warn};

use super::identity::{AuthenticatedUser, KeyStrategy};
use super::response::{
    apply_rate_limit_headers, internal_error, service_unavailable, too_many_requests,
};
use crate::error::GatekeeperError;
use crate::ratelimit::{CheckRequest, RateLimiter};

/// What to do with a request when the store cannot be reached.
///
/// There is no silent default: fail-closed is chosen unless configured
/// otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Answer 503 without calling the handler.
    #[default]
    FailClosed,
    /// Call the handler as if the request had been admitted.
    FailOpen,
}

/// Computes the cost of a request.
pub type CostFn = Arc<dyn Fn(&Request) -> u64 + Send + Sync>;

/// Rate limiting layer.
///
/// Admitted requests reach the wrapped service and get `X-RateLimit-*`
/// headers on the way out. Rejected requests are answered with 429 and
/// never reach it.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    key_strategy: KeyStrategy,
    failure_mode: FailureMode,
    cost_fn: Option<CostFn>,
    tier_header: Option<String>,
    trusted_proxy_headers: Arc<[String]>,
}

impl RateLimitLayer {
    /// Limit by socket peer address, fail closed, one unit per request.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            key_strategy: KeyStrategy::default(),
            failure_mode: FailureMode::default(),
            cost_fn: None,
            tier_header: None,
            trusted_proxy_headers: Arc::from(Vec::new()),
        }
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn cost_fn<F>(mut self, cost: F) -> Self
    where
        F: Fn(&Request) -> u64 + Send + Sync + 'static,
    {
        self.cost_fn = Some(Arc::new(cost));
        self
    }

    /// Read the caller's tier from this header when no
    /// [`AuthenticatedUser`] tier is present. Only use a header that a
    /// trusted proxy sets.
    pub fn tier_header(mut self, header: impl Into<String>) -> Self {
        self.tier_header = Some(header.into().to_ascii_lowercase());
        self
    }

    /// Take the client address from these headers, in order, before the
    /// socket peer. None are trusted by default; only list headers that a
    /// proxy in front of the service overwrites.
    pub fn trusted_proxy_headers<I, H>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: Into<String>,
    {
        self.trusted_proxy_headers = headers
            .into_iter()
            .map(|header| header.into().to_ascii_lowercase())
            .collect();
        self
    }

    fn check_request_for(&self, request: &Request) -> CheckRequest {
        let identifier = self
            .key_strategy
            .identify(request, &self.trusted_proxy_headers);
        let cost = self.cost_fn.as_ref().map_or(1, |cost| cost(request));
        let check = CheckRequest::new(identifier).with_cost(cost);

        let user_tier = request
            .extensions()
            .get::<AuthenticatedUser>()
            .and_then(|user| user.tier.clone());
        let header_tier = || {
            let header = self.tier_header.as_deref()?;
            request
                .headers()
                .get(header)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        match user_tier.or_else(header_tier) {
            Some(tier) => check.with_tier(tier),
            None => check,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    layer: RateLimitLayer,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // Keep the service that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();

        Box::pin(async move {
            let check = layer.check_request_for(&request);

            match layer.limiter.check_request(&check).await {
                Ok(result) if result.allowed => {
                    let mut response = inner.call(request).await?;
                    if !result.is_unlimited() {
                        apply_rate_limit_headers(response.headers_mut(), &result);
                    }
                    Ok(response)
                }
                Ok(result) => Ok(too_many_requests(&result)),
                Err(GatekeeperError::Store(e)) => match layer.failure_mode {
                    FailureMode::FailOpen => {
                        warn!(error = %e, identifier = %check.identifier(), "Rate limit store failed, admitting request");
                        inner.call(request).await
                    }
                    FailureMode::FailClosed => {
                        error!(error = %e, identifier = %check.identifier(), "Rate limit store failed, rejecting request");
                        Ok(service_unavailable())
                    }
                },
                Err(e) => {
                    error!(error = %e, "Rate limiter rejected its configuration");
                    Ok(internal_error())
                }
            }
        })
    }
}

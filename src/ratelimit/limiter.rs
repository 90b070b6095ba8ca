//! Core rate limiter implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::algorithm::Algorithm;
use super::decision::{retry_after_secs, CheckRequest, LimitContext, RateLimitResult};
use super::key::{IdentityKey, KeyBuilder, KeyGenerator, KEY_SEPARATOR};
use super::policy::{FixedLimit, LimitObserver, LimitResolver, SkipPredicate};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::{GatekeeperError, Result};
use crate::store::Store;

/// Default ceiling when none is configured.
const DEFAULT_LIMIT: u64 = 100;
/// Default window when none is configured.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// The rate limit decision engine.
///
/// Holds only read-only configuration; all counters live in the [`Store`].
/// One instance can be shared (typically behind an `Arc`) by every task in
/// the process, and several limiters can share one store as long as their
/// key prefixes differ.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    window: Duration,
    algorithm: Algorithm,
    limit: Arc<dyn LimitResolver>,
    keys: KeyBuilder,
    skip: Option<Arc<dyn SkipPredicate>>,
    observer: Option<Arc<dyn LimitObserver>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Start configuring a limiter over `store`.
    pub fn builder(store: Arc<dyn Store>) -> RateLimiterBuilder {
        RateLimiterBuilder::new(store)
    }

    /// Check a request of `cost` units for `identifier`.
    ///
    /// An exceeded limit is a successful return with `allowed == false`.
    /// Errors are configuration problems or store failures, which are
    /// passed through untouched.
    pub async fn check(&self, identifier: &str, cost: u64) -> Result<RateLimitResult> {
        self.check_request(&CheckRequest::new(identifier).with_cost(cost))
            .await
    }

    /// Check a fully described request.
    pub async fn check_request(&self, request: &CheckRequest) -> Result<RateLimitResult> {
        let now = self.clock.now();

        if let Some(skip) = &self.skip {
            if skip.should_skip(request) {
                trace!(identifier = %request.identifier(), "Skipping rate limit");
                return Ok(RateLimitResult::unlimited(now));
            }
        }

        if request.cost() == 0 {
            return Err(GatekeeperError::InvalidRequest(
                "cost must be greater than zero".to_string(),
            ));
        }

        let limit = self.limit.resolve_limit(request);
        if limit == 0 {
            return Err(GatekeeperError::Configuration(format!(
                "resolved max for {} must be greater than zero",
                request.identifier()
            )));
        }

        let key = self.keys.key_for(request.identifier());
        let storage_key = key.to_storage_key();

        trace!(
            key = %key,
            cost = request.cost(),
            limit = limit,
            algorithm = %self.algorithm,
            "Checking rate limit"
        );

        let result = match self.algorithm {
            Algorithm::FixedWindow => {
                self.check_fixed_window(&storage_key, request.cost(), limit, now)
                    .await?
            }
            Algorithm::SlidingLog => {
                self.check_sliding_log(&storage_key, request.cost(), limit, now)
                    .await?
            }
            Algorithm::CostBased => {
                self.check_cost_based(&storage_key, request.cost(), limit, now)
                    .await?
            }
        };

        if !result.allowed {
            debug!(
                key = %key,
                limit = limit,
                retry_after = ?result.retry_after,
                "Rate limit exceeded"
            );
            if let Some(observer) = &self.observer {
                observer.on_limit_reached(&LimitContext {
                    key: &key,
                    request,
                    result: &result,
                });
            }
        }

        Ok(result)
    }

    async fn check_fixed_window(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult> {
        let hit = self.store.increment(key, self.window, cost).await?;
        let allowed = hit.count <= limit;

        Ok(RateLimitResult {
            allowed,
            limit,
            remaining: limit.saturating_sub(hit.count),
            reset_at: after(now, hit.ttl),
            retry_after: (!allowed).then(|| retry_after_secs(hit.ttl.as_millis())),
        })
    }

    async fn check_sliding_log(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult> {
        let now_ms = now.timestamp_millis();
        let window_ms = duration_millis(self.window);
        let log = self
            .store
            .record(key, self.window, cost, limit, now_ms)
            .await?;

        // Capacity next frees up when the oldest surviving entry ages out.
        let wait_ms = match log.oldest_ms {
            Some(oldest) => window_ms.saturating_sub(now_ms.saturating_sub(oldest)).max(0),
            None => window_ms,
        };

        Ok(RateLimitResult {
            allowed: log.admitted,
            limit,
            remaining: limit.saturating_sub(log.count),
            reset_at: after(now, Duration::from_millis(wait_ms as u64)),
            retry_after: (!log.admitted).then(|| retry_after_secs(wait_ms as u128)),
        })
    }

    async fn check_cost_based(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult> {
        let consumption = self.store.consume(key, self.window, cost, limit).await?;

        Ok(RateLimitResult {
            allowed: consumption.admitted,
            limit,
            remaining: limit.saturating_sub(consumption.count),
            reset_at: after(now, consumption.ttl),
            retry_after: (!consumption.admitted)
                .then(|| retry_after_secs(consumption.ttl.as_millis())),
        })
    }

    /// Current usage recorded for `identifier`, if any.
    pub async fn usage(&self, identifier: &str) -> Result<Option<u64>> {
        let key = self.keys.key_for(identifier);
        Ok(self.store.get(&key.to_storage_key()).await?)
    }

    /// Forget all usage recorded for `identifier`.
    pub async fn reset(&self, identifier: &str) -> Result<()> {
        let key = self.keys.key_for(identifier);
        debug!(key = %key, "Resetting rate limit");
        Ok(self.store.reset(&key.to_storage_key()).await?)
    }

    /// The algorithm this limiter was built with.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window)
            .field("algorithm", &self.algorithm)
            .field("keys", &self.keys)
            .field("static_limit", &self.limit.static_limit())
            .finish_non_exhaustive()
    }
}

fn after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|wait| now.checked_add_signed(wait))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    store: Arc<dyn Store>,
    window: Duration,
    algorithm: Algorithm,
    limit: Arc<dyn LimitResolver>,
    key_prefix: String,
    key_generator: Arc<dyn KeyGenerator>,
    skip: Option<Arc<dyn SkipPredicate>>,
    observer: Option<Arc<dyn LimitObserver>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiterBuilder {
    fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            window: DEFAULT_WINDOW,
            algorithm: Algorithm::default(),
            limit: Arc::new(FixedLimit(DEFAULT_LIMIT)),
            key_prefix: String::new(),
            key_generator: Arc::new(IdentityKey),
            skip: None,
            observer: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn window_ms(self, window_ms: u64) -> Self {
        self.window(Duration::from_millis(window_ms))
    }

    /// A fixed ceiling for every check.
    pub fn max(mut self, max: u64) -> Self {
        self.limit = Arc::new(FixedLimit(max));
        self
    }

    /// A ceiling resolved per check.
    pub fn max_with(mut self, resolver: impl LimitResolver + 'static) -> Self {
        self.limit = Arc::new(resolver);
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Namespace for this limiter's keys in a shared store.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn key_generator(mut self, generator: impl KeyGenerator + 'static) -> Self {
        self.key_generator = Arc::new(generator);
        self
    }

    pub fn skip(mut self, predicate: impl SkipPredicate + 'static) -> Self {
        self.skip = Some(Arc::new(predicate));
        self
    }

    pub fn on_limit_reached(mut self, observer: impl LimitObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate and build the limiter.
    pub fn build(self) -> Result<RateLimiter> {
        if self.window.as_millis() == 0 {
            return Err(GatekeeperError::Configuration(
                "window must be at least one millisecond".to_string(),
            ));
        }
        if self.key_prefix.contains(KEY_SEPARATOR) {
            return Err(GatekeeperError::Configuration(format!(
                "key prefix {:?} must not contain {:?}",
                self.key_prefix, KEY_SEPARATOR
            )));
        }
        if self.limit.static_limit() == Some(0) {
            return Err(GatekeeperError::Configuration(
                "max must be greater than zero".to_string(),
            ));
        }

        debug!(
            window_ms = duration_millis(self.window),
            algorithm = %self.algorithm,
            prefix = %self.key_prefix,
            "Rate limiter configured"
        );

        Ok(RateLimiter {
            store: self.store,
            window: self.window,
            algorithm: self.algorithm,
            limit: self.limit,
            keys: KeyBuilder::new(self.key_prefix, self.key_generator),
            skip: self.skip,
            observer: self.observer,
            clock: self.clock,
        })
    }
}

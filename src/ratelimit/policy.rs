//! Per-check policy hooks: limit resolution, bypass, and rejection observers.

use super::decision::{CheckRequest, LimitContext};

/// Resolves the ceiling for one check.
///
/// Evaluated once per check, before any store interaction. Two checks on the
/// same key may resolve different ceilings; they share one counter and are
/// each compared against their own.
pub trait LimitResolver: Send + Sync {
    fn resolve_limit(&self, request: &CheckRequest) -> u64;

    /// The limit, if it does not depend on the request. Lets a limiter
    /// reject a zero ceiling at construction time.
    fn static_limit(&self) -> Option<u64> {
        None
    }
}

/// The same ceiling for every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedLimit(pub u64);

impl LimitResolver for FixedLimit {
    fn resolve_limit(&self, _request: &CheckRequest) -> u64 {
        self.0
    }

    fn static_limit(&self) -> Option<u64> {
        Some(self.0)
    }
}

impl<F> LimitResolver for F
where
    F: Fn(&CheckRequest) -> u64 + Send + Sync,
{
    fn resolve_limit(&self, request: &CheckRequest) -> u64 {
        self(request)
    }
}

/// Decides whether a check bypasses the limiter entirely.
pub trait SkipPredicate: Send + Sync {
    fn should_skip(&self, request: &CheckRequest) -> bool;
}

impl<F> SkipPredicate for F
where
    F: Fn(&CheckRequest) -> bool + Send + Sync,
{
    fn should_skip(&self, request: &CheckRequest) -> bool {
        self(request)
    }
}

/// Told about every rejected check, once, after the decision is final.
pub trait LimitObserver: Send + Sync {
    fn on_limit_reached(&self, context: &LimitContext<'_>);
}

impl<F> LimitObserver for F
where
    F: Fn(&LimitContext<'_>) + Send + Sync,
{
    fn on_limit_reached(&self, context: &LimitContext<'_>) {
        self(context)
    }
}

//! Inputs and outputs of a rate limit check.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::key::RateLimitKey;

/// Limit and remaining value reported for skipped checks.
pub const UNLIMITED: u64 = u64::MAX;

/// Everything a limiter knows about one check.
///
/// Limit resolvers and skip predicates see only this, so a tiered limit has
/// to travel here alongside the identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    identifier: String,
    cost: u64,
    tier: Option<String>,
}

impl CheckRequest {
    /// A unit-cost check for `identifier`.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            cost: 1,
            tier: None,
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn tier(&self) -> Option<&str> {
        self.tier.as_deref()
    }
}

/// The decision for one check. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    /// The ceiling resolved for this check
    pub limit: u64,
    /// Always within `0..=limit`
    pub remaining: u64,
    /// When `remaining` next increases
    pub reset_at: DateTime<Utc>,
    /// Whole seconds to wait, present only on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    /// The result of a bypassed check.
    pub fn unlimited(now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit: UNLIMITED,
            remaining: UNLIMITED,
            reset_at: now,
            retry_after: None,
        }
    }

    /// Whether this check was bypassed rather than counted.
    pub fn is_unlimited(&self) -> bool {
        self.limit == UNLIMITED
    }

    /// `reset_at` as Unix epoch seconds.
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_at.timestamp()
    }
}

/// What a limit observer is told about a rejection.
#[derive(Debug, Clone)]
pub struct LimitContext<'a> {
    pub key: &'a RateLimitKey,
    pub request: &'a CheckRequest,
    pub result: &'a RateLimitResult,
}

/// Whole seconds in `millis`, rounded up, never below one.
pub(crate) fn retry_after_secs(millis: u128) -> u64 {
    let secs = millis.div_ceil(1000).max(1);
    u64::try_from(secs).unwrap_or(u64::MAX)
}

//! Counter storage for rate limiting.
//!
//! A [`Store`] owns every piece of mutable rate limit state. The limiter
//! itself is read-only configuration, so correctness under concurrent load
//! comes down to each store operation being atomic per key.

mod memory;
mod redis;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};

/// Errors raised by a store backend.
///
/// These are always surfaced to the caller; a store never turns a failure
/// into an "allowed" or "denied" answer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(#[from] ::redis::RedisError),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed store response: {0}")]
    MalformedResponse(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of an unconditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHit {
    /// Cumulative cost in the current window, including this increment.
    pub count: u64,
    /// Time left before the window closes.
    pub ttl: Duration,
}

/// Outcome of a conditional (budget-bounded) increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumption {
    /// Whether the cost fit in the remaining budget and was committed.
    pub admitted: bool,
    /// Cumulative cost in the current window after the operation.
    pub count: u64,
    /// Time left before the window closes.
    pub ttl: Duration,
}

/// Outcome of a sliding-log admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogAdmission {
    /// Whether the entry was appended.
    pub admitted: bool,
    /// Total cost of live entries in the trailing window after the operation.
    pub count: u64,
    /// Timestamp (epoch millis) of the oldest surviving entry.
    pub oldest_ms: Option<i64>,
}

/// A shared counter backend.
///
/// All operations may suspend on I/O and must be atomic with respect to
/// concurrent callers on the same key.
#[async_trait]
pub trait Store: Send + Sync {
    /// Add `cost` to the counter for `key`, opening a new window of length
    /// `window` if none is live.
    async fn increment(&self, key: &str, window: Duration, cost: u64)
        -> Result<StoreHit, StoreError>;

    /// Add `cost` to the counter for `key` only if the total stays within
    /// `limit`. A rejected call leaves the counter untouched.
    async fn consume(
        &self,
        key: &str,
        window: Duration,
        cost: u64,
        limit: u64,
    ) -> Result<Consumption, StoreError>;

    /// Prune log entries admitted at or before `now_ms - window`, then
    /// append one entry stamped `now_ms` and weighted by `cost` if the live
    /// total plus `cost` stays within `limit`.
    async fn record(
        &self,
        key: &str,
        window: Duration,
        cost: u64,
        limit: u64,
        now_ms: i64,
    ) -> Result<LogAdmission, StoreError>;

    /// Current count for `key`, or `None` if no live record exists.
    /// Sliding-log keys are pruned to their trailing window first.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Drop all state for `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

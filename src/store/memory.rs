//! In-process counter store.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{Consumption, LogAdmission, Store, StoreError, StoreHit};
use crate::clock::{duration_millis, Clock, SystemClock};

/// One sliding-log admission, weighted by its cost.
#[derive(Debug, Clone, Copy)]
struct LogEntry {
    /// When the admission leaves the trailing window, epoch millis
    expires_at: i64,
    cost: u64,
}

/// Per-key state.
#[derive(Debug, Clone)]
struct RateLimitRecord {
    /// Cumulative cost in the current window, or of the live log entries
    count: u64,
    /// Sliding-log admissions, oldest first
    log: VecDeque<LogEntry>,
    /// When the record may be discarded, epoch millis
    expires_at: i64,
}

impl RateLimitRecord {
    fn open(now: i64, window_ms: i64) -> Self {
        Self {
            count: 0,
            log: VecDeque::new(),
            expires_at: now.saturating_add(window_ms),
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    fn ttl(&self, now: i64) -> Duration {
        let left = self.expires_at.saturating_sub(now).max(0);
        Duration::from_millis(left as u64)
    }

    /// Drop log entries admitted at or before `now - window`.
    fn prune(&mut self, now: i64) {
        while let Some(entry) = self.log.front().copied() {
            if entry.expires_at > now {
                break;
            }
            self.log.pop_front();
            self.count = self.count.saturating_sub(entry.cost);
        }
    }
}

/// A store backed by a process-local concurrent map.
///
/// Each key's record is mutated under its map shard lock, which makes every
/// operation atomic within this process. It is not shared across processes;
/// use [`RedisStore`](super::RedisStore) for horizontally scaled deployments.
///
/// Expired records are discarded lazily on access. [`MemoryStore::sweep`]
/// and [`MemoryStore::spawn_sweeper`] bound memory for keys that are never
/// touched again.
#[derive(Debug)]
pub struct MemoryStore {
    records: DashMap<String, RateLimitRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Remove every expired record. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, "Swept expired rate limit records");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` on the tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the store has
    /// been dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => break,
                }
            }
        })
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        cost: u64,
    ) -> Result<StoreHit, StoreError> {
        let now = self.clock.now_millis();
        let window_ms = duration_millis(window);

        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::open(now, window_ms));
        if record.is_expired(now) {
            trace!(key, "Window elapsed, opening a new one");
            *record = RateLimitRecord::open(now, window_ms);
        }

        record.count = record.count.saturating_add(cost);
        Ok(StoreHit {
            count: record.count,
            ttl: record.ttl(now),
        })
    }

    async fn consume(
        &self,
        key: &str,
        window: Duration,
        cost: u64,
        limit: u64,
    ) -> Result<Consumption, StoreError> {
        let now = self.clock.now_millis();
        let window_ms = duration_millis(window);

        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::open(now, window_ms));
        if record.is_expired(now) {
            *record = RateLimitRecord::open(now, window_ms);
        }

        let admitted = record.count.saturating_add(cost) <= limit;
        if admitted {
            record.count += cost;
        }

        Ok(Consumption {
            admitted,
            count: record.count,
            ttl: record.ttl(now),
        })
    }

    async fn record(
        &self,
        key: &str,
        window: Duration,
        cost: u64,
        limit: u64,
        now_ms: i64,
    ) -> Result<LogAdmission, StoreError> {
        let window_ms = duration_millis(window);

        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::open(now_ms, window_ms));
        record.prune(now_ms);

        let admitted = record.count.saturating_add(cost) <= limit;
        if admitted {
            let expires_at = now_ms.saturating_add(window_ms);
            record.log.push_back(LogEntry { expires_at, cost });
            record.count += cost;
            record.expires_at = expires_at;
        }

        Ok(LogAdmission {
            admitted,
            count: record.count,
            oldest_ms: record
                .log
                .front()
                .map(|entry| entry.expires_at.saturating_sub(window_ms)),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_millis();
        self.records.remove_if(key, |_, record| record.is_expired(now));
        Ok(self.records.get_mut(key).map(|mut record| {
            record.prune(now);
            record.count
        }))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::DateTime;

    const WINDOW: Duration = Duration::from_secs(10);

    fn manual_store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp_millis(1_000_000).unwrap(),
        ));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_increment_accumulates_within_window() {
        let (clock, store) = manual_store();

        let hit = store.increment("k", WINDOW, 1).await.unwrap();
        assert_eq!(hit.count, 1);
        assert_eq!(hit.ttl, WINDOW);

        clock.advance(Duration::from_secs(4));
        let hit = store.increment("k", WINDOW, 3).await.unwrap();
        assert_eq!(hit.count, 4);
        assert_eq!(hit.ttl, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_increment_resets_after_window() {
        let (clock, store) = manual_store();

        store.increment("k", WINDOW, 7).await.unwrap();
        clock.advance(WINDOW);

        let hit = store.increment("k", WINDOW, 1).await.unwrap();
        assert_eq!(hit.count, 1);
        assert_eq!(hit.ttl, WINDOW);
    }

    #[tokio::test]
    async fn test_consume_rejection_leaves_count_untouched() {
        let (_clock, store) = manual_store();

        let first = store.consume("k", WINDOW, 8, 10).await.unwrap();
        assert!(first.admitted);
        assert_eq!(first.count, 8);

        let second = store.consume("k", WINDOW, 3, 10).await.unwrap();
        assert!(!second.admitted);
        assert_eq!(second.count, 8);

        let third = store.consume("k", WINDOW, 2, 10).await.unwrap();
        assert!(third.admitted);
        assert_eq!(third.count, 10);
    }

    #[tokio::test]
    async fn test_record_prunes_old_entries() {
        let (clock, store) = manual_store();
        let start = clock.now_millis();

        let first = store.record("k", WINDOW, 2, 3, start).await.unwrap();
        assert!(first.admitted);
        assert_eq!(first.oldest_ms, Some(start));

        clock.advance(Duration::from_secs(5));
        let second = store.record("k", WINDOW, 2, 3, clock.now_millis()).await.unwrap();
        assert!(!second.admitted);
        assert_eq!(second.count, 2);

        // Entries stamped exactly `window` ago no longer count.
        clock.advance(Duration::from_secs(5));
        let third = store.record("k", WINDOW, 2, 3, clock.now_millis()).await.unwrap();
        assert!(third.admitted);
        assert_eq!(third.count, 2);
        assert_eq!(third.oldest_ms, Some(clock.now_millis()));
    }

    #[tokio::test]
    async fn test_get_prunes_sliding_log() {
        let (clock, store) = manual_store();

        store.record("k", WINDOW, 5, 10, clock.now_millis()).await.unwrap();
        clock.advance(Duration::from_secs(5));
        store.record("k", WINDOW, 3, 10, clock.now_millis()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(8));

        // The first admission leaves the trailing window.
        clock.advance(Duration::from_secs(7));
        assert_eq!(store.get("k").await.unwrap(), Some(3));

        clock.advance(Duration::from_secs(3));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_record_keeps_one_entry_per_admission() {
        let (clock, store) = manual_store();
        let now = clock.now_millis();

        let admission = store
            .record("k", WINDOW, u64::MAX / 2, u64::MAX, now)
            .await
            .unwrap();
        assert!(admission.admitted);
        assert_eq!(admission.count, u64::MAX / 2);
        assert_eq!(admission.oldest_ms, Some(now));
        assert_eq!(store.records.get("k").unwrap().log.len(), 1);
    }

    #[tokio::test]
    async fn test_get_discards_expired_record() {
        let (clock, store) = manual_store();

        assert_eq!(store.get("k").await.unwrap(), None);
        store.increment("k", WINDOW, 2).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(2));

        clock.advance(WINDOW);
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_reset_removes_key() {
        let (_clock, store) = manual_store();

        store.increment("a", WINDOW, 1).await.unwrap();
        store.increment("b", WINDOW, 1).await.unwrap();
        store.reset("a").await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (clock, store) = manual_store();

        store.increment("old", Duration::from_secs(1), 1).await.unwrap();
        store.increment("new", Duration::from_secs(60), 1).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("new").await.unwrap(), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        store.increment("shared", WINDOW, 1).await.unwrap();
                    }
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert_eq!(store.get("shared").await.unwrap(), Some(64 * 25));
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_store_dropped() {
        let store = Arc::new(MemoryStore::new());
        let handle = store.spawn_sweeper(Duration::from_millis(5));

        drop(store);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not exit")
            .unwrap();
    }
}

//! Redis-backed counter store for multi-instance deployments.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{RedisResult, Script};
use async_trait::async_trait;
use tracing::{info, trace};
use uuid::Uuid;

use super::{Consumption, LogAdmission, Store, StoreError, StoreHit};
use crate::clock::duration_millis;

/// Conditional INCRBY: commits only if the new total fits in the budget.
const CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local cost = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local window = tonumber(ARGV[3])

local current = tonumber(redis.call('GET', key) or '0')
if current + cost > limit then
    return {0, current, redis.call('PTTL', key)}
end

local count = redis.call('INCRBY', key, cost)
if redis.call('PTTL', key) < 0 then
    redis.call('PEXPIRE', key, window)
end
return {1, count, redis.call('PTTL', key)}
"#;

/// Sliding log over a sorted set. Each admission is one member named
/// `nonce:cost` and scored by the instant it leaves the window, so any
/// reader can prune without knowing the window length.
const RECORD_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])
local nonce = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
local count = 0
for _, member in ipairs(redis.call('ZRANGE', key, 0, -1)) do
    count = count + tonumber(string.match(member, ':(%d+)$'))
end

local admitted = 0
if count + cost <= limit then
    redis.call('ZADD', key, now + window, nonce .. ':' .. ARGV[3])
    count = count + cost
    admitted = 1
    redis.call('PEXPIRE', key, window)
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ts = -1
if oldest[2] then
    oldest_ts = tonumber(oldest[2]) - window
end
return {admitted, count, oldest_ts}
"#;

/// Reads a counter regardless of which mode wrote it. Sliding-log entries
/// are counted against the server clock.
const GET_SCRIPT: &str = r#"
local key = KEYS[1]
local kind = redis.call('TYPE', key)['ok']
if kind == 'string' then
    return tonumber(redis.call('GET', key))
elseif kind == 'zset' then
    local time = redis.call('TIME')
    local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
    local count = 0
    for _, member in ipairs(redis.call('ZRANGEBYSCORE', key, '(' .. now, '+inf')) do
        count = count + tonumber(string.match(member, ':(%d+)$'))
    end
    if count > 0 then
        return count
    end
end
return false
"#;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Upper bound on any single store operation
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            command_timeout: Duration::from_secs(1),
        }
    }
}

/// A store shared by every process pointed at the same Redis.
///
/// Counter increments run as a `MULTI` pipeline so the value and its TTL are
/// set together; conditional and sliding-log operations run as Lua scripts
/// so the check and the commit happen in one server-side step. The
/// connection is multiplexed and reconnects on its own, and the store is
/// cheap to clone and share across limiters.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    command_timeout: Duration,
    consume_script: Script,
    record_script: Script,
    get_script: Script,
}

impl RedisStore {
    /// Connect to Redis.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(config.url.as_str())?;
        let connection = tokio::time::timeout(config.command_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(config.command_timeout))??;

        info!(url = %config.url, "Connected to Redis rate limit store");

        Ok(Self {
            connection,
            command_timeout: config.command_timeout,
            consume_script: Script::new(CONSUME_SCRIPT),
            record_script: Script::new(RECORD_SCRIPT),
            get_script: Script::new(GET_SCRIPT),
        })
    }

    /// Bound a Redis call by the configured timeout.
    async fn run<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, call).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

fn ttl_from_pttl(pttl: i64, window: Duration) -> Duration {
    // PTTL is -1 for a key without expiry and -2 for a missing key.
    if pttl > 0 {
        Duration::from_millis(pttl as u64)
    } else {
        window
    }
}

fn triple(reply: Vec<i64>) -> Result<(i64, i64, i64), StoreError> {
    match reply.as_slice() {
        [a, b, c] => Ok((*a, *b, *c)),
        other => Err(StoreError::MalformedResponse(format!(
            "expected 3 integers, got {}",
            other.len()
        ))),
    }
}

fn non_negative(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::MalformedResponse(format!("negative {}: {}", what, value)))
}

#[async_trait]
impl Store for RedisStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        cost: u64,
    ) -> Result<StoreHit, StoreError> {
        let mut conn = self.connection.clone();
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("PX")
            .arg(duration_millis(window))
            .arg("NX")
            .ignore()
            .cmd("INCRBY")
            .arg(key)
            .arg(cost)
            .cmd("PTTL")
            .arg(key);

        let (count, pttl): (i64, i64) = self.run(pipe.query_async(&mut conn)).await?;
        trace!(key, count, pttl, "Redis increment");

        Ok(StoreHit {
            count: non_negative(count, "count")?,
            ttl: ttl_from_pttl(pttl, window),
        })
    }

    async fn consume(
        &self,
        key: &str,
        window: Duration,
        cost: u64,
        limit: u64,
    ) -> Result<Consumption, StoreError> {
        let mut conn = self.connection.clone();
        let reply: Vec<i64> = self
            .run(
                self.consume_script
                    .key(key)
                    .arg(cost)
                    .arg(limit)
                    .arg(duration_millis(window))
                    .invoke_async(&mut conn),
            )
            .await?;
        let (admitted, count, pttl) = triple(reply)?;

        Ok(Consumption {
            admitted: admitted == 1,
            count: non_negative(count, "count")?,
            ttl: ttl_from_pttl(pttl, window),
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
        let mut conn = self.connection.clone();
        let nonce = Uuid::new_v4().simple().to_string();
        let reply: Vec<i64> = self
            .run(
                self.record_script
                    .key(key)
                    .arg(now_ms)
                    .arg(duration_millis(window))
                    .arg(cost)
                    .arg(limit)
                    .arg(nonce)
                    .invoke_async(&mut conn),
            )
            .await?;
        let (admitted, count, oldest) = triple(reply)?;

        Ok(LogAdmission {
            admitted: admitted == 1,
            count: non_negative(count, "count")?,
            oldest_ms: (oldest >= 0).then_some(oldest),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection.clone();
        let count: Option<i64> = self
            .run(self.get_script.key(key).invoke_async(&mut conn))
            .await?;
        count.map(|c| non_negative(c, "count")).transpose()
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _removed: i64 = self
            .run(::redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Connect to the Redis named by `REDIS_URL`, if any.
    async fn test_store() -> Option<RedisStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        let config = RedisStoreConfig {
            url,
            command_timeout: Duration::from_secs(2),
        };
        Some(RedisStore::connect(config).await.expect("REDIS_URL set but unreachable"))
    }

    fn unique_key(name: &str) -> String {
        format!("gatekeeper-test:{}:{}", name, Uuid::new_v4())
    }

    #[test]
    fn test_ttl_from_pttl() {
        let window = Duration::from_secs(5);
        assert_eq!(ttl_from_pttl(1200, window), Duration::from_millis(1200));
        assert_eq!(ttl_from_pttl(-1, window), window);
        assert_eq!(ttl_from_pttl(-2, window), window);
    }

    #[test]
    fn test_triple_rejects_short_reply() {
        assert_eq!(triple(vec![1, 2, 3]).unwrap(), (1, 2, 3));
        assert!(matches!(
            triple(vec![1]),
            Err(StoreError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_an_error() {
        let config = RedisStoreConfig {
            url: "redis://127.0.0.1:1".to_string(),
            command_timeout: Duration::from_millis(500),
        };
        let result = RedisStore::connect(config).await;
        assert!(matches!(
            result,
            Err(StoreError::Backend(_)) | Err(StoreError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_redis_increment_and_reset() {
        let Some(store) = test_store().await else {
            return;
        };
        let key = unique_key("increment");
        let window = Duration::from_secs(30);

        let hit = store.increment(&key, window, 2).await.unwrap();
        assert_eq!(hit.count, 2);
        assert!(hit.ttl <= window && hit.ttl > Duration::ZERO);

        let hit = store.increment(&key, window, 3).await.unwrap();
        assert_eq!(hit.count, 5);
        assert_eq!(store.get(&key).await.unwrap(), Some(5));

        store.reset(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_redis_consume_is_side_effect_free_on_rejection() {
        let Some(store) = test_store().await else {
            return;
        };
        let key = unique_key("consume");
        let window = Duration::from_secs(30);

        assert!(store.consume(&key, window, 80, 100).await.unwrap().admitted);
        let rejected = store.consume(&key, window, 30, 100).await.unwrap();
        assert!(!rejected.admitted);
        assert_eq!(rejected.count, 80);
        assert_eq!(store.get(&key).await.unwrap(), Some(80));

        store.reset(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_record_sliding_log() {
        let Some(store) = test_store().await else {
            return;
        };
        let key = unique_key("record");
        let window = Duration::from_millis(1_000);
        let start = 1_700_000_000_000_i64;

        let first = store.record(&key, window, 3, 4, start).await.unwrap();
        assert!(first.admitted);
        assert_eq!(first.count, 3);
        assert_eq!(first.oldest_ms, Some(start));

        let second = store.record(&key, window, 2, 4, start + 500).await.unwrap();
        assert!(!second.admitted);
        assert_eq!(second.count, 3);

        let third = store.record(&key, window, 2, 4, start + 1_000).await.unwrap();
        assert!(third.admitted);
        assert_eq!(third.count, 2);
        assert_eq!(third.oldest_ms, Some(start + 1_000));

        store.reset(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_get_prunes_sliding_log() {
        let Some(store) = test_store().await else {
            return;
        };
        let key = unique_key("record-get");
        let window = Duration::from_secs(30);
        let now = chrono::Utc::now().timestamp_millis();

        // One admission already outside the window, one inside it.
        store.record(&key, window, 4, 100, now - 40_000).await.unwrap();
        let live = store.record(&key, window, 1_000_000, u64::MAX, now).await.unwrap();
        assert!(live.admitted);
        assert_eq!(live.count, 1_000_000);

        assert_eq!(store.get(&key).await.unwrap(), Some(1_000_000));

        store.reset(&key).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_redis_concurrent_consume_loses_nothing() {
        let Some(store) = test_store().await else {
            return;
        };
        let store = Arc::new(store);
        let key = Arc::new(unique_key("concurrent"));
        let window = Duration::from_secs(30);

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.consume(&key, window, 1, 40).await.unwrap() })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|outcome| outcome.as_ref().unwrap().admitted)
            .count() as u64;

        assert_eq!(admitted, 40);
        assert_eq!(store.get(&key).await.unwrap(), Some(admitted));

        store.reset(&key).await.unwrap();
    }
}

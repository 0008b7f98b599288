//! Redis-backed [`CounterStore`].
//!
//! The sliding-window check runs as one Lua script, so purge, count, admit,
//! and TTL refresh execute as a single atomic unit on the server: one round
//! trip, no TOCTOU window between observing a vacancy and claiming it.
//! Distributed locks use `SET NX PX` with a fencing token and a
//! compare-and-delete release script.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::StoreError;
use crate::store::{CounterStore, LockToken, WindowReply};

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub url: String,
    pub connect_timeout: Duration,
    /// Poll interval while waiting on a contended lock.
    pub lock_retry_interval: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            lock_retry_interval: Duration::from_millis(25),
        }
    }
}

/// Shared counter store backed by Redis.
pub struct RedisStore {
    conn: ConnectionManager,
    window_script: Script,
    unlock_script: Script,
    lock_retry_interval: Duration,
    /// Disambiguates window entries admitted in the same millisecond and
    /// fences lock tokens issued by this process.
    sequence: AtomicU64,
    instance_id: u64,
}

impl RedisStore {
    /// Connect with default settings.
    pub async fn connect(url: impl Into<String>) -> Result<Self, StoreError> {
        Self::new(RedisStoreConfig { url: url.into(), ..RedisStoreConfig::default() }).await
    }

    pub async fn new(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str()).map_err(store_err)?;
        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Unavailable("connection timed out".to_string()))?
            .map_err(store_err)?;

        tracing::info!(url = %config.url, "connected to redis counter store");

        // KEYS[1] window key; ARGV: now, window_millis, limit, entry suffix.
        // Returns {admitted, occupancy_before_admit, oldest_score_or_-1}.
        let window_script = Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])
            local limit = tonumber(ARGV[3])

            redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
            local count = redis.call('ZCARD', key)
            local admitted = 0
            if count < limit then
                redis.call('ZADD', key, now, ARGV[1] .. '-' .. ARGV[4])
                admitted = 1
            end
            redis.call('PEXPIRE', key, window)

            local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
            local oldest_score = -1
            if oldest[2] then
                oldest_score = tonumber(oldest[2])
            end
            return {admitted, count, oldest_score}
            "#,
        );

        let unlock_script = Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        );

        Ok(Self {
            conn,
            window_script,
            unlock_script,
            lock_retry_interval: config.lock_retry_interval,
            sequence: AtomicU64::new(1),
            instance_id: rand::random(),
        })
    }

    fn lock_value(&self, token: &LockToken) -> String {
        format!("{:x}:{:x}", self.instance_id, token.0)
    }

    async fn try_set_lock(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }
}

fn store_err(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn check_window(
        &self,
        key: &str,
        now_millis: u64,
        window_millis: u64,
        limit: u32,
    ) -> Result<WindowReply, StoreError> {
        let suffix = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .window_script
            .key(key)
            .arg(now_millis)
            .arg(window_millis)
            .arg(limit)
            .arg(format!("{:x}:{:x}", self.instance_id, suffix))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        let admitted = reply.first().copied().unwrap_or(0) == 1;
        let occupancy = reply.get(1).copied().unwrap_or(0).max(0) as u64;
        let oldest = reply.get(2).copied().filter(|&s| s >= 0).map(|s| s as u64);
        Ok(WindowReply { admitted, occupancy, oldest_entry_millis: oldest })
    }

    async fn window_occupancy(
        &self,
        key: &str,
        now_millis: u64,
        window_millis: u64,
    ) -> Result<u64, StoreError> {
        let cutoff = now_millis.saturating_sub(window_millis);
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(cutoff)
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(count)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LockToken, StoreError> {
        let token = LockToken(self.sequence.fetch_add(1, Ordering::Relaxed));
        let value = self.lock_value(&token);
        let started = tokio::time::Instant::now();
        loop {
            if self.try_set_lock(key, &value, ttl).await? {
                return Ok(token);
            }
            if started.elapsed() >= max_wait {
                return Err(StoreError::LockTimeout {
                    key: key.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.lock_retry_interval).await;
        }
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _deleted: i64 = self
            .unlock_script
            .key(key)
            .arg(self.lock_value(token))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn read_counter(&self, key: &str) -> Result<Option<(u64, u64)>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(store_err)?;
        Ok(raw.and_then(|v| {
            let (count, start) = v.split_once(':')?;
            Some((count.parse().ok()?, start.parse().ok()?))
        }))
    }

    async fn write_counter(
        &self,
        key: &str,
        count: u64,
        window_start_millis: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = redis::cmd("SET")
            .arg(key)
            .arg(format!("{}:{}", count, window_start_millis))
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

//! Redis-backed counter store.
//!
//! Each window is a hash `{count, start}` with a millisecond TTL equal to the
//! window (or lockout) length. All mutations run as Lua scripts, so opening a
//! window and counting its first request is one atomic server-side step and
//! concurrent instances share a single fixed-window counter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, trace};

use super::counter::{CounterStore, RateWindow};
use crate::clock::{add_duration, Clock, SystemClock};
use crate::error::{Result, TurnstileError};

/// KEYS[1] = window key, ARGV[1] = now (ms), ARGV[2] = window (ms).
/// Returns {count, pttl, start}.
const INCREMENT_SCRIPT: &str = r#"
local opened = redis.call('HSETNX', KEYS[1], 'start', ARGV[1])
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
if opened == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  ttl = tonumber(ARGV[2])
end
local start = redis.call('HGET', KEYS[1], 'start') or ARGV[1]
return {count, ttl, tonumber(start)}
"#;

/// KEYS[1] = window key. Returns {count, pttl, start} or nil.
const READ_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return false
end
local count = redis.call('HGET', KEYS[1], 'count') or '0'
local start = redis.call('HGET', KEYS[1], 'start') or '0'
return {tonumber(count), redis.call('PTTL', KEYS[1]), tonumber(start)}
"#;

/// KEYS[1] = window key, ARGV[1] = lockout (ms).
const BLOCK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  return 1
end
return 0
"#;

/// KEYS[1] = window key, ARGV[1] = expected window start (ms).
const DECREMENT_SCRIPT: &str = r#"
local start = redis.call('HGET', KEYS[1], 'start')
if not start or tonumber(start) ~= tonumber(ARGV[1]) then
  return 0
end
local count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
if count <= 0 then
  return 0
end
redis.call('HINCRBY', KEYS[1], 'count', -1)
return 1
"#;

/// Counter store shared through a Redis-compatible server.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    key_prefix: String,
    clock: Arc<dyn Clock>,
    increment: Arc<Script>,
    read: Arc<Script>,
    block: Arc<Script>,
    decrement: Arc<Script>,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Create a store on an established connection.
    pub fn new(connection: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self::with_clock(connection, key_prefix, Arc::new(SystemClock::new()))
    }

    /// Create a store whose window starts are stamped by `clock`.
    pub fn with_clock(
        connection: ConnectionManager,
        key_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.into(),
            clock,
            increment: Arc::new(Script::new(INCREMENT_SCRIPT)),
            read: Arc::new(Script::new(READ_SCRIPT)),
            block: Arc::new(Script::new(BLOCK_SCRIPT)),
            decrement: Arc::new(Script::new(DECREMENT_SCRIPT)),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn to_window(key: &str, now: DateTime<Utc>, count: i64, ttl_ms: i64, start_ms: i64) -> Result<RateWindow> {
        let window_start = DateTime::<Utc>::from_timestamp_millis(start_ms).ok_or_else(|| {
            TurnstileError::StoreUnavailable(format!("invalid window start {} for {}", start_ms, key))
        })?;

        Ok(RateWindow {
            key: key.to_string(),
            count: count.max(0) as u64,
            window_start,
            reset_at: add_duration(now, Duration::from_millis(ttl_ms.max(0) as u64)),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<RateWindow> {
        let mut conn = self.connection.clone();
        let now = self.clock.now();

        let (count, ttl, start): (i64, i64, i64) = self
            .increment
            .key(self.redis_key(key))
            .arg(now.timestamp_millis())
            .arg(window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, count = count, ttl_ms = ttl, "Incremented redis window");
        Self::to_window(key, now, count, ttl, start)
    }

    async fn get(&self, key: &str) -> Result<Option<RateWindow>> {
        let mut conn = self.connection.clone();
        let now = self.clock.now();

        let found: Option<(i64, i64, i64)> = self
            .read
            .key(self.redis_key(key))
            .invoke_async(&mut conn)
            .await?;

        match found {
            Some((count, ttl, start)) if ttl != -2 => {
                Self::to_window(key, now, count, ttl, start).map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let applied: i64 = self
            .block
            .key(self.redis_key(key))
            .arg(duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, block_ms = duration.as_millis() as u64, applied = applied == 1, "Blocked redis window");
        Ok(())
    }

    async fn decrement(&self, window: &RateWindow) -> Result<bool> {
        let mut conn = self.connection.clone();
        let applied: i64 = self
            .decrement
            .key(self.redis_key(&window.key))
            .arg(window.window_start.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running Redis-compatible server.

    async fn connect() -> RedisCounterStore {
        let client = redis::Client::open("redis://127.0.0.1:6379").expect("client");
        let conn = ConnectionManager::new(client).await.expect("connection");
        RedisCounterStore::new(conn, format!("turnstile-test:{}:", Utc::now().timestamp_nanos_opt().unwrap_or_default()))
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_increment_and_read() {
        let store = connect().await;
        let window = Duration::from_secs(60);

        assert_eq!(store.increment("k", window).await.unwrap().count, 1);
        let second = store.increment("k", window).await.unwrap();
        assert_eq!(second.count, 2);

        let read = store.get("k").await.unwrap().unwrap();
        assert_eq!(read.count, 2);
        assert_eq!(read.window_start, second.window_start);

        store.reset("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_decrement_requires_same_window() {
        let store = connect().await;
        let ticket = store.increment("d", Duration::from_secs(60)).await.unwrap();

        let mut stale = ticket.clone();
        stale.window_start -= chrono::Duration::seconds(60);
        assert!(!store.decrement(&stale).await.unwrap());
        assert!(store.decrement(&ticket).await.unwrap());
        assert_eq!(store.get("d").await.unwrap().unwrap().count, 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_window_survives_count_back_to_zero() {
        let store = connect().await;
        let ticket = store.increment("z", Duration::from_secs(60)).await.unwrap();
        assert!(store.decrement(&ticket).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let next = store.increment("z", Duration::from_secs(60)).await.unwrap();
        assert_eq!(next.count, 1);
        assert_eq!(next.window_start, ticket.window_start);
        assert!(next.remaining_ttl(Utc::now()) < Duration::from_secs(60));
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_block_extends_ttl() {
        let store = connect().await;
        store.increment("b", Duration::from_secs(60)).await.unwrap();
        store.block("b", Duration::from_secs(300)).await.unwrap();

        let window = store.get("b").await.unwrap().unwrap();
        assert!(window.remaining_ttl(Utc::now()) > Duration::from_secs(250));
    }
}

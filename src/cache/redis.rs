//! Redis-backed cache store.
//!
//! Every key is stored under a namespace prefix which `keys` strips again, so
//! callers only ever see their own key space.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::trace;

use super::store::CacheStore;
use crate::error::Result;

/// KEYS[1] = set key, ARGV[1] = member, ARGV[2] = ttl (ms, 0 = none).
const ADD_TO_SET_SCRIPT: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
redis.call('SADD', KEYS[1], ARGV[1])
local ttl = tonumber(ARGV[2])
if ttl == 0 then
  redis.call('PERSIST', KEYS[1])
  return 1
end
local current = redis.call('PTTL', KEYS[1])
if existed == 0 or (current >= 0 and current < ttl) then
  redis.call('PEXPIRE', KEYS[1], ttl)
end
return 1
"#;

/// KEYS[1] = set key. Returns the members and deletes the set.
const TAKE_MEMBERS_SCRIPT: &str = r#"
local members = redis.call('SMEMBERS', KEYS[1])
redis.call('DEL', KEYS[1])
return members
"#;

const SCAN_BATCH: usize = 250;

/// Cache store shared through a Redis-compatible server.
#[derive(Clone)]
pub struct RedisCacheStore {
    connection: ConnectionManager,
    namespace: String,
    add_to_set: Arc<Script>,
    take_members: Arc<Script>,
}

impl fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCacheStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl RedisCacheStore {
    /// Create a store writing under `namespace`.
    pub fn new(connection: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            connection,
            namespace: namespace.into(),
            add_to_set: Arc::new(Script::new(ADD_TO_SET_SCRIPT)),
            take_members: Arc::new(Script::new(TAKE_MEMBERS_SCRIPT)),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn set_command(&self, key: &str, value: Vec<u8>, ttl: Duration) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.redis_key(key)).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = self
            .set_command(key, value, ttl)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let found: i64 = redis::cmd("EXISTS")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(found > 0)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let namespaced: Vec<String> = keys.iter().map(|key| self.redis_key(key)).collect();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(namespaced)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.add_command(self.set_command(&key, value, ttl)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let full_pattern = self.redis_key(pattern);
        let mut found = BTreeSet::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            found.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&self.namespace).map(str::to_string)),
            );

            if next == 0 {
                break;
            }
            cursor = next;
        }

        trace!(pattern = %pattern, matched = found.len(), "Scanned cache keys");
        Ok(found.into_iter().collect())
    }

    async fn add_to_set(&self, set_key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .add_to_set
            .key(self.redis_key(set_key))
            .arg(member)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let mut members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.redis_key(set_key))
            .query_async(&mut conn)
            .await?;
        members.sort();
        Ok(members)
    }

    async fn take_members(&self, set_key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let mut members: Vec<String> = self
            .take_members
            .key(self.redis_key(set_key))
            .invoke_async(&mut conn)
            .await?;
        members.sort();
        Ok(members)
    }
}

//! Cache facade used by application code.
//!
//! Wraps a [`CacheStore`] with JSON encoding, a default TTL, tag-based
//! invalidation and cache-aside helpers. The facade fails soft: every store
//! call is time-boxed, and a store fault degrades a read to a miss and a
//! write or invalidation to "no effect", with a warning logged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::store::CacheStore;
use super::tags::TagIndex;
use crate::config::CacheConfig;
use crate::error::{within, Result};
use crate::ratelimit::DEFAULT_OPERATION_TIMEOUT;

/// A cached value as read by [`Cache::get_value`].
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// The entry decoded as JSON
    Json(Value),
    /// The entry is not JSON; returned unchanged
    Raw(Vec<u8>),
}

/// Join key segments with `:`, skipping empty ones.
///
/// `compose_key(&["user", "42", "profile"])` yields `user:42:profile`.
pub fn compose_key(segments: &[&str]) -> String {
    segments
        .iter()
        .filter(|segment| !segment.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(":")
}

type Inflight = DashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// One caller's registration for an in-flight key.
///
/// Dropping it (normally or by cancellation) releases the caller's handle
/// first, then removes the key once no other caller holds one.
struct InflightSlot<'a> {
    registry: &'a Inflight,
    key: &'a str,
    lock: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl<'a> InflightSlot<'a> {
    fn acquire(registry: &'a Inflight, key: &'a str) -> Self {
        let lock = registry
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        Self {
            registry,
            key,
            lock: Some(lock),
        }
    }

    async fn lock(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match &self.lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        self.registry
            .remove_if(self.key, |_, registered| Arc::strong_count(registered) <= 1);
    }
}

/// Application-facing cache.
#[derive(Debug, Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    tags: TagIndex,
    default_ttl: Duration,
    operation_timeout: Duration,
    inflight: Arc<Inflight>,
}

impl Cache {
    /// Create a cache over `store` using the configured TTL and tag prefix.
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            tags: TagIndex::new(store.clone(), config.tag_prefix.clone()),
            store,
            default_ttl: config.default_ttl(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Override the per-call store deadline.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// TTL used when a write does not name one.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// The tag index backing this cache.
    pub fn tags(&self) -> &TagIndex {
        &self.tags
    }

    async fn soft<T, F>(&self, op: &'static str, key: &str, fallback: T, fut: F) -> T
    where
        F: Future<Output = Result<T>>,
    {
        match within(self.operation_timeout, fut).await {
            Ok(value) => value,
            Err(e) => {
                warn!(op = op, key = %key, error = %e, "Cache store failed, degrading");
                fallback
            }
        }
    }

    fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Option<Vec<u8>> {
        match serde_json::to_vec(value) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode cache value");
                None
            }
        }
    }

    fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Option<T> {
        match serde_json::from_slice(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key = %key, error = %e, "Cached value does not decode, treating as miss");
                None
            }
        }
    }

    /// Read raw bytes.
    pub async fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        self.soft("get", key, None, self.store.get(key)).await
    }

    /// Read a value, decoding JSON where possible.
    ///
    /// Entries that are not valid JSON are passed through as
    /// [`CachedValue::Raw`].
    pub async fn get_value(&self, key: &str) -> Option<CachedValue> {
        let bytes = self.get_raw(key).await?;
        Some(match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => CachedValue::Json(value),
            Err(_) => CachedValue::Raw(bytes),
        })
    }

    /// Read and decode a typed value. Decode failures are misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_raw(key).await?;
        Self::decode(key, &bytes)
    }

    /// Write raw bytes. `ttl` defaults to the configured TTL.
    pub async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.soft("set", key, false, async {
            self.store.set(key, value, ttl).await.map(|_| true)
        })
        .await
    }

    /// Encode `value` as JSON and write it.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match Self::encode(key, value) {
            Some(bytes) => self.set_raw(key, bytes, ttl).await,
            None => false,
        }
    }

    /// Delete a key. Returns whether a live entry was removed.
    pub async fn del(&self, key: &str) -> bool {
        self.soft("del", key, false, self.store.del(key)).await
    }

    /// Whether a live entry exists.
    pub async fn exists(&self, key: &str) -> bool {
        self.soft("exists", key, false, self.store.exists(key)).await
    }

    /// Read several typed values, aligned with `keys`.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        let label = keys.join(",");
        let raw = self
            .soft("mget", &label, vec![None; keys.len()], self.store.mget(keys))
            .await;

        keys.iter()
            .zip(raw)
            .map(|(key, bytes)| bytes.and_then(|bytes| Self::decode(key, &bytes)))
            .collect()
    }

    /// Write several values with one TTL.
    pub async fn mset<T: Serialize>(&self, entries: &[(String, T)], ttl: Option<Duration>) -> bool {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match Self::encode(key, value) {
                Some(bytes) => encoded.push((key.clone(), bytes)),
                None => return false,
            }
        }

        let ttl = ttl.unwrap_or(self.default_ttl);
        let label = entries.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>().join(",");
        self.soft("mset", &label, false, async {
            self.store.mset(encoded, ttl).await.map(|_| true)
        })
        .await
    }

    /// Live keys matching a glob pattern.
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        self.soft("keys", pattern, Vec::new(), self.store.keys(pattern)).await
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let mut removed = 0;
        for key in self.store.keys(pattern).await? {
            if self.store.del(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete every key matching a glob pattern. Returns the number removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let removed = self
            .soft("invalidate_pattern", pattern, 0, self.delete_matching(pattern))
            .await;
        debug!(pattern = %pattern, removed = removed, "Invalidated pattern");
        removed
    }

    /// Write a value and record it under each tag.
    pub async fn set_with_tags<T, S>(
        &self,
        key: &str,
        value: &T,
        tags: &[S],
        ttl: Option<Duration>,
    ) -> bool
    where
        T: Serialize + ?Sized,
        S: AsRef<str> + Sync,
    {
        let Some(bytes) = Self::encode(key, value) else {
            return false;
        };
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.soft("set_with_tags", key, false, async {
            self.tags.set_with_tags(key, bytes, tags, ttl).await.map(|_| true)
        })
        .await
    }

    /// Delete every key recorded under `tag`. Returns the number removed.
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        self.soft("invalidate_tag", tag, 0, self.tags.invalidate_tag(tag)).await
    }

    /// Invalidate several tags. Returns the total number removed.
    pub async fn invalidate_tags<S: AsRef<str> + Sync>(&self, tags: &[S]) -> usize {
        let mut removed = 0;
        for tag in tags {
            removed += self.invalidate_tag(tag.as_ref()).await;
        }
        removed
    }

    /// Keys recorded under `tag`.
    pub async fn tag_members(&self, tag: &str) -> Vec<String> {
        self.soft("tag_members", tag, Vec::new(), self.tags.members(tag)).await
    }

    /// Cache-aside read.
    ///
    /// On a miss `compute` runs and its result is stored before being
    /// returned. Concurrent misses on one key each run `compute`; use
    /// [`Cache::get_or_compute_coalesced`] to run it once. Errors from
    /// `compute` propagate and nothing is stored.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(hit);
        }

        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    /// Cache-aside read that runs `compute` at most once per key at a time.
    ///
    /// Callers missing on the same key queue on a per-key lock; the first
    /// computes and stores, the rest re-read the stored value. If the store
    /// is unavailable every caller still computes in turn.
    pub async fn get_or_compute_coalesced<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(hit);
        }

        let slot = InflightSlot::acquire(&self.inflight, key);
        let _guard = slot.lock().await;
        match self.get::<T>(key).await {
            Some(hit) => Ok(hit),
            None => {
                let value = compute().await?;
                self.set(key, &value, ttl).await;
                Ok(value)
            }
        }
    }
}

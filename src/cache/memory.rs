//! In-process cache store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::store::{glob_match, CacheStore};
use crate::clock::{add_duration, Clock, SystemClock};
use crate::error::{Result, TurnstileError};

#[derive(Debug, Clone)]
enum Slot {
    Value(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    slot: Slot,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

fn wrong_type(key: &str) -> TurnstileError {
    TurnstileError::StoreUnavailable(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

/// Cache store backed by an in-process map.
///
/// Expired entries are invisible immediately and reclaimed lazily on access
/// or by [`MemoryCacheStore::purge_expired`].
#[derive(Debug)]
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired cache entries");
        }
        removed
    }

    /// Number of stored entries, live or not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
        if ttl.is_zero() {
            None
        } else {
            Some(add_duration(now, ttl))
        }
    }

    fn live(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let found = self.entries.get(key).map(|entry| entry.clone());
        match found {
            Some(entry) if entry.is_live(now) => Some(entry),
            Some(_) => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.live(key).map(|entry| entry.slot) {
            Some(Slot::Value(value)) => Ok(Some(value)),
            Some(Slot::Set(_)) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let expires_at = Self::expiry(self.clock.now(), ttl);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                slot: Slot::Value(value),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        Ok(keys
            .iter()
            .map(|key| match self.live(key).map(|entry| entry.slot) {
                Some(Slot::Value(value)) => Some(value),
                _ => None,
            })
            .collect())
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()> {
        let expires_at = Self::expiry(self.clock.now(), ttl);
        for (key, value) in entries {
            self.entries.insert(
                key,
                CacheEntry {
                    slot: Slot::Value(value),
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut matched: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_live(now) && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        matched.sort();
        Ok(matched)
    }

    async fn add_to_set(&self, set_key: &str, member: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let requested = Self::expiry(now, ttl);
        let fresh = || CacheEntry {
            slot: Slot::Set(BTreeSet::from([member.to_string()])),
            expires_at: requested,
        };

        match self.entries.entry(set_key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let entry = occupied.get_mut();
                match &mut entry.slot {
                    Slot::Set(members) => {
                        members.insert(member.to_string());
                    }
                    Slot::Value(_) => return Err(wrong_type(set_key)),
                }
                entry.expires_at = match (entry.expires_at, requested) {
                    (Some(current), Some(requested)) => Some(current.max(requested)),
                    _ => None,
                };
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(fresh());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh());
            }
        }
        Ok(())
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>> {
        match self.live(set_key).map(|entry| entry.slot) {
            Some(Slot::Set(members)) => Ok(members.into_iter().collect()),
            Some(Slot::Value(_)) => Err(wrong_type(set_key)),
            None => Ok(Vec::new()),
        }
    }

    async fn take_members(&self, set_key: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        let removed = self.entries.remove_if(set_key, |_, entry| {
            !entry.is_live(now) || matches!(entry.slot, Slot::Set(_))
        });

        match removed {
            Some((_, entry)) if entry.is_live(now) => match entry.slot {
                Slot::Set(members) => Ok(members.into_iter().collect()),
                Slot::Value(_) => Err(wrong_type(set_key)),
            },
            Some(_) => Ok(Vec::new()),
            None if self.entries.contains_key(set_key) => Err(wrong_type(set_key)),
            None => Ok(Vec::new()),
        }
    }
}

//! In-process counter store.
//!
//! Windows live in a sharded `DashMap`. The entry API holds the shard lock for
//! the whole read-modify-write, so increments on one key are linearizable even
//! on a multi-threaded runtime. Only correct for a single-instance deployment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::counter::{CounterStore, RateWindow};
use crate::clock::{add_duration, Clock, SystemClock};
use crate::error::Result;

/// Counter store backed by an in-process map.
#[derive(Debug)]
pub struct MemoryCounterStore {
    windows: DashMap<String, RateWindow>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired window. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired rate limit windows");
        }
        removed
    }

    /// Number of tracked windows, live or not yet purged.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no window is tracked.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<RateWindow> {
        let now = self.clock.now();

        let current = match self.windows.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    trace!(key = %key, "Window expired, opening a new one");
                    occupied.insert(RateWindow::open(key, now, window));
                } else {
                    occupied.get_mut().count += 1;
                }
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                trace!(key = %key, "Opening first window");
                vacant.insert(RateWindow::open(key, now, window)).clone()
            }
        };

        Ok(current)
    }

    async fn get(&self, key: &str) -> Result<Option<RateWindow>> {
        let now = self.clock.now();
        Ok(self
            .windows
            .get(key)
            .filter(|window| !window.is_expired(now))
            .map(|window| window.clone()))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.windows.remove(key);
        Ok(())
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        let now = self.clock.now();
        if let Some(mut window) = self.windows.get_mut(key) {
            if !window.is_expired(now) {
                window.reset_at = add_duration(now, duration);
            }
        }
        Ok(())
    }

    async fn decrement(&self, ticket: &RateWindow) -> Result<bool> {
        let now = self.clock.now();
        let Some(mut window) = self.windows.get_mut(&ticket.key) else {
            return Ok(false);
        };

        if window.window_start != ticket.window_start || window.is_expired(now) || window.count == 0
        {
            return Ok(false);
        }

        window.count -= 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    const MINUTE: Duration = Duration::from_secs(60);

    fn store() -> (MemoryCounterStore, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        (MemoryCounterStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_increment_counts_within_window() {
        let (store, _clock) = store();

        assert_eq!(store.increment("k", MINUTE).await.unwrap().count, 1);
        assert_eq!(store.increment("k", MINUTE).await.unwrap().count, 2);
        assert_eq!(store.get("k").await.unwrap().unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_expired_window_is_replaced() {
        let (store, clock) = store();

        let first = store.increment("k", MINUTE).await.unwrap();
        store.increment("k", MINUTE).await.unwrap();

        clock.advance(MINUTE);
        assert!(store.get("k").await.unwrap().is_none());

        let second = store.increment("k", MINUTE).await.unwrap();
        assert_eq!(second.count, 1);
        assert!(second.window_start > first.window_start);
    }

    #[tokio::test]
    async fn test_block_extends_reset() {
        let (store, clock) = store();

        store.increment("k", MINUTE).await.unwrap();
        store.block("k", Duration::from_secs(300)).await.unwrap();

        clock.advance(Duration::from_secs(120));
        let window = store.get("k").await.unwrap().unwrap();
        assert_eq!(window.remaining_ttl(clock.now()), Duration::from_secs(180));
    }

    #[tokio::test]
    async fn test_block_absent_key_is_noop() {
        let (store, _clock) = store();
        store.block("nobody", MINUTE).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_decrement_only_same_window() {
        let (store, clock) = store();

        let ticket = store.increment("k", MINUTE).await.unwrap();
        store.increment("k", MINUTE).await.unwrap();
        assert!(store.decrement(&ticket).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().count, 1);

        // A newer window must not be decremented by a stale ticket
        clock.advance(MINUTE);
        store.increment("k", MINUTE).await.unwrap();
        assert!(!store.decrement(&ticket).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_window_survives_count_back_to_zero() {
        let (store, clock) = store();

        let ticket = store.increment("k", MINUTE).await.unwrap();
        assert!(store.decrement(&ticket).await.unwrap());

        clock.advance(Duration::from_secs(20));
        let next = store.increment("k", MINUTE).await.unwrap();
        assert_eq!(next.count, 1);
        assert_eq!(next.window_start, ticket.window_start);
        assert_eq!(next.remaining_ttl(clock.now()), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store();

        store.increment("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long", MINUTE).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new());

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("hot", MINUTE).await.unwrap().count })
            })
            .collect();

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=200).collect::<Vec<u64>>());
    }
}

//! Rate limit windows and the counter store contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::{add_duration, millis_until};
use crate::error::Result;

/// A fixed window counter for one (policy, identity) pair.
///
/// `window_start` identifies the window instance: a window that expires and
/// is reopened always gets a later start, which is what conditional-count
/// reports match against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    /// Full store key (policy prefix + identity)
    pub key: String,
    /// Requests counted in this window
    pub count: u64,
    /// When the window was opened
    pub window_start: DateTime<Utc>,
    /// When the window (or its lockout) ends
    pub reset_at: DateTime<Utc>,
}

impl RateWindow {
    /// Open a new window at `now` holding a single request.
    pub fn open(key: &str, now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            key: key.to_string(),
            count: 1,
            window_start: now,
            reset_at: add_duration(now, window),
        }
    }

    /// Whether the window has rolled over at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.reset_at <= now
    }

    /// Time left until reset.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        Duration::from_millis(millis_until(now, self.reset_at))
    }
}

/// Shared storage for rate limit counters.
///
/// Every operation is atomic per key. Implementations never need cross-key
/// transactions.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Count one request against `key`.
    ///
    /// An absent or expired window is replaced by a fresh one with `count = 1`
    /// and `reset_at = now + window`; that replacement and the first increment
    /// are indivisible with respect to concurrent callers.
    async fn increment(&self, key: &str, window: Duration) -> Result<RateWindow>;

    /// Read the live window for `key` without counting.
    async fn get(&self, key: &str) -> Result<Option<RateWindow>>;

    /// Forget the window for `key`.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Force the window for `key` to end `duration` from now, regardless of
    /// its count. Blocking a key with no live window is a no-op.
    async fn block(&self, key: &str, duration: Duration) -> Result<()>;

    /// Take back one request from `window`.
    ///
    /// Only applies when the live window for `window.key` is the same window
    /// instance (same `window_start`), has not expired and has a positive
    /// count. Returns whether a decrement happened.
    async fn decrement(&self, window: &RateWindow) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_window() {
        let now = Utc::now();
        let window = RateWindow::open("rl:ip:1.2.3.4", now, Duration::from_secs(60));

        assert_eq!(window.count, 1);
        assert_eq!(window.window_start, now);
        assert_eq!(window.reset_at, now + chrono::Duration::seconds(60));
        assert_eq!(window.remaining_ttl(now), Duration::from_secs(60));
    }

    #[test]
    fn test_window_expiry_boundary() {
        let now = Utc::now();
        let window = RateWindow::open("k", now, Duration::from_secs(1));

        assert!(!window.is_expired(now));
        assert!(window.is_expired(now + chrono::Duration::seconds(1)));
        assert_eq!(window.remaining_ttl(now + chrono::Duration::seconds(2)), Duration::ZERO);
    }
}

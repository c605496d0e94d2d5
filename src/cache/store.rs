//! Cache storage contract.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Key/value store with per-entry expiry and string sets.
///
/// Values are opaque bytes; encoding is the caller's concern. A zero `ttl`
/// stores an entry without expiry. Reads never return expired entries.
#[async_trait]
pub trait CacheStore: Send + Sync + Debug {
    /// Fetch a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value, replacing any previous entry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Delete an entry. Returns whether a live entry was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Whether a live entry exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Fetch several values, positionally aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Store several values with one shared TTL.
    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()>;

    /// Live keys matching a glob pattern (`*` and `?`), sorted.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Add `member` to the set at `set_key`.
    ///
    /// The set expires no earlier than `ttl` from now; an existing longer
    /// expiry is kept.
    async fn add_to_set(&self, set_key: &str, member: &str, ttl: Duration) -> Result<()>;

    /// Members of the set at `set_key`, sorted. Empty when absent.
    async fn members(&self, set_key: &str) -> Result<Vec<String>>;

    /// Remove the set at `set_key` and return its members, sorted.
    ///
    /// Reading and removing happen as one step: a member added concurrently
    /// either shows up in the result or lands in a fresh set.
    async fn take_members(&self, set_key: &str) -> Result<Vec<String>>;
}

/// Match `text` against a glob where `*` is any run and `?` any one char.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            t = resume;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_literal() {
        assert!(glob_match("user:1", "user:1"));
        assert!(!glob_match("user:1", "user:12"));
    }

    #[test]
    fn test_glob_star() {
        assert!(glob_match("user:*", "user:1:profile"));
        assert!(glob_match("*:profile", "user:1:profile"));
        assert!(glob_match("*", ""));
        assert!(glob_match("user:*:profile", "user:42:profile"));
        assert!(!glob_match("user:*:profile", "user:42:settings"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_match("user:?", "user:7"));
        assert!(!glob_match("user:?", "user:77"));
        assert!(glob_match("??:*", "ab:c"));
    }
}

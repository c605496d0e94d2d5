//! Tag index for group invalidation.
//!
//! Each tag owns a set of cache keys stored in the same key space under the
//! tag prefix. The set lives at least as long as its longest-lived member;
//! members that expired on their own stay listed until the tag is
//! invalidated, where deleting them is a harmless no-op.
//!
//! Invalidation detaches the whole set in one store operation before deleting
//! any member, so a key tagged while an invalidation runs ends up in a fresh
//! set that the next invalidation still reaches.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::store::CacheStore;
use crate::error::Result;

/// Maps tags to the cache keys written under them.
#[derive(Debug, Clone)]
pub struct TagIndex {
    store: Arc<dyn CacheStore>,
    tag_prefix: String,
}

impl TagIndex {
    /// Create an index whose tag sets live at `<tag_prefix><tag>`.
    pub fn new(store: Arc<dyn CacheStore>, tag_prefix: impl Into<String>) -> Self {
        Self {
            store,
            tag_prefix: tag_prefix.into(),
        }
    }

    /// Key holding the members of `tag`.
    pub fn tag_key(&self, tag: &str) -> String {
        format!("{}{}", self.tag_prefix, tag)
    }

    /// Write `value` at `key`, then record `key` under every tag.
    pub async fn set_with_tags<S>(
        &self,
        key: &str,
        value: Vec<u8>,
        tags: &[S],
        ttl: Duration,
    ) -> Result<()>
    where
        S: AsRef<str> + Sync,
    {
        self.store.set(key, value, ttl).await?;
        for tag in tags {
            self.store
                .add_to_set(&self.tag_key(tag.as_ref()), key, ttl)
                .await?;
        }
        Ok(())
    }

    /// Detach the tag set, then delete every key it listed.
    ///
    /// Returns how many keys were actually removed.
    pub async fn invalidate_tag(&self, tag: &str) -> Result<usize> {
        let members = self.store.take_members(&self.tag_key(tag)).await?;

        let mut removed = 0;
        for member in &members {
            if self.store.del(member).await? {
                removed += 1;
            }
        }

        debug!(tag = %tag, listed = members.len(), removed = removed, "Invalidated tag");
        Ok(removed)
    }

    /// Invalidate several tags. Returns the total number of removed keys.
    pub async fn invalidate_tags<S>(&self, tags: &[S]) -> Result<usize>
    where
        S: AsRef<str> + Sync,
    {
        let mut removed = 0;
        for tag in tags {
            removed += self.invalidate_tag(tag.as_ref()).await?;
        }
        Ok(removed)
    }

    /// Keys currently recorded under `tag`.
    pub async fn members(&self, tag: &str) -> Result<Vec<String>> {
        self.store.members(&self.tag_key(tag)).await
    }
}

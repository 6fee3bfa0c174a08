//! In-process TTL backend for the recent-message cache.
//!
//! Entries are cloned out on read so no `DashMap` guard is held across an
//! await point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use companion_core::cache::{CachedMessages, ConversationKey, RecentMessageCache};
use companion_types::config::CacheConfig;
use companion_types::error::CacheError;

struct Entry {
    value: CachedMessages,
    expires_at: Instant,
}

/// `DashMap`-backed cache with a fixed time-to-live.
///
/// A disabled cache accepts writes and never returns a hit.
#[derive(Clone)]
pub struct InMemoryMessageCache {
    entries: Arc<DashMap<ConversationKey, Entry>>,
    ttl: Duration,
    enabled: bool,
}

impl InMemoryMessageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            enabled: true,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ..Self::new(Duration::from_secs(config.ttl_secs.max(1)))
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

impl RecentMessageCache for InMemoryMessageCache {
    async fn get(&self, key: &ConversationKey) -> Result<Option<CachedMessages>, CacheError> {
        if !self.enabled {
            return Ok(None);
        }
        let hit = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if hit.is_none() {
            self.entries.remove(key);
        }
        Ok(hit)
    }

    async fn put(&self, key: &ConversationKey, entry: CachedMessages) -> Result<(), CacheError> {
        if !self.enabled {
            return Ok(());
        }
        self.entries.insert(
            *key,
            Entry {
                value: entry,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, key: &ConversationKey) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

//! In-process fast tier with LRU eviction and memory management

use crate::config::FastTierConfig;
use crate::entry::{CacheEntry, StoredValue};
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionEvent, EvictionReason};
use crate::key::CacheKey;
use crate::strategy::TierKind;
use crate::tier::TierStore;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Counters local to the fast tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastTierStats {
    /// Number of entries currently held
    pub entries: usize,

    /// Cumulative size of held values
    pub size_bytes: usize,

    /// Evictions because of the entry limit
    pub evictions_count: u64,

    /// Evictions because of the size limit
    pub evictions_size: u64,

    /// Entries dropped after their TTL elapsed
    pub evictions_ttl: u64,

    /// Explicit deletes and cleanups
    pub invalidations: u64,
}

/// Bounded in-memory tier
///
/// Bounded by entry count and cumulative value size. Over either limit, the
/// least recently accessed entries are evicted on insert until both hold.
/// Expired entries are dropped lazily on read; [`FastTier::cleanup_expired`]
/// is an optional sweep.
pub struct FastTier {
    config: FastTierConfig,

    store: RwLock<FastStore>,
}

/// Internal storage
#[derive(Default)]
struct FastStore {
    /// Main storage: full key -> entry
    entries: HashMap<String, Slot>,

    /// Access order: tick -> full key, oldest first
    recency: BTreeMap<u64, String>,

    /// Monotonic access counter
    tick: u64,

    /// Total size of held values in bytes
    current_size_bytes: usize,

    stats: FastTierStats,
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

impl FastStore {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(slot) = self.entries.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            slot.entry.mark_accessed();
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        self.current_size_bytes = self
            .current_size_bytes
            .saturating_sub(slot.entry.metadata.size_bytes);
        Some(slot.entry)
    }

    fn pop_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        if let Some(slot) = self.entries.remove(&key) {
            self.current_size_bytes = self
                .current_size_bytes
                .saturating_sub(slot.entry.metadata.size_bytes);
        }
        Some(key)
    }
}

impl FastTier {
    /// Create a new fast tier with the given limits
    pub fn new(config: FastTierConfig) -> Self {
        info!(
            "Initializing fast tier: max_entries={}, max_size_bytes={}",
            config.max_entries, config.max_size_bytes
        );

        Self {
            config,
            store: RwLock::new(FastStore::default()),
        }
    }

    pub fn config(&self) -> &FastTierConfig {
        &self.config
    }

    /// Insert an entry, evicting least recently used entries as needed
    ///
    /// Returns one event per limit that forced evictions, empty when the
    /// entry fit without any.
    pub async fn insert(
        &self,
        key: &CacheKey,
        value: Bytes,
        ttl: Duration,
    ) -> Result<Vec<EvictionEvent>> {
        let entry = CacheEntry::new(key.clone(), value, ttl);
        let size = entry.metadata.size_bytes;

        if size > self.config.max_size_bytes {
            return Err(CacheError::EntryTooLarge {
                size_bytes: size,
                max_size_bytes: self.config.max_size_bytes,
            });
        }

        let mut store = self.store.write().await;

        // An overwrite must not count the old value against the limits
        if store.remove(key.as_str()).is_some() {
            debug!("Updating existing fast tier entry: {}", key);
        } else {
            debug!("Inserting new fast tier entry: {}", key);
        }

        let events = self.evict_if_needed(&mut store, size);

        let tick = store.next_tick();
        store.recency.insert(tick, key.as_str().to_string());
        store.entries.insert(key.as_str().to_string(), Slot { entry, tick });
        store.current_size_bytes += size;

        Ok(events)
    }

    /// Read a live entry, refreshing its recency
    pub async fn lookup(&self, key: &CacheKey) -> Option<StoredValue> {
        let mut store = self.store.write().await;

        let expired = match store.entries.get(key.as_str()) {
            None => {
                debug!("Fast tier miss: {}", key);
                return None;
            }
            Some(slot) => slot.entry.is_expired(),
        };

        if expired {
            debug!("Fast tier entry expired: {}", key);
            store.remove(key.as_str());
            store.stats.evictions_ttl += 1;
            return None;
        }

        store.touch(key.as_str());
        debug!("Fast tier hit: {}", key);
        store
            .entries
            .get(key.as_str())
            .map(|slot| slot.entry.to_stored())
    }

    /// Check if a live key exists (without updating access time)
    pub async fn contains_key(&self, key: &CacheKey) -> bool {
        let store = self.store.read().await;
        store
            .entries
            .get(key.as_str())
            .is_some_and(|slot| !slot.entry.is_expired())
    }

    /// Remove a specific entry
    pub async fn remove(&self, key: &CacheKey) -> Option<EvictionEvent> {
        let mut store = self.store.write().await;
        store.remove(key.as_str())?;
        store.stats.invalidations += 1;

        debug!("Removed fast tier entry: {}", key);
        Some(EvictionEvent::new(
            EvictionReason::Invalidated,
            vec![key.as_str().to_string()],
        ))
    }

    /// Remove every entry whose key starts with `prefix`
    pub async fn remove_prefix(&self, prefix: &str) -> EvictionEvent {
        let mut store = self.store.write().await;

        let keys: Vec<String> = store
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            store.remove(key);
        }
        store.stats.invalidations += keys.len() as u64;

        info!("Removed {} fast tier entries with prefix {:?}", keys.len(), prefix);
        EvictionEvent::new(EvictionReason::Cleanup, keys)
    }

    /// Clear all entries
    pub async fn clear(&self) -> usize {
        let mut store = self.store.write().await;

        let count = store.entries.len();
        store.entries.clear();
        store.recency.clear();
        store.current_size_bytes = 0;
        store.stats.invalidations += count as u64;

        info!("Cleared {} entries from fast tier", count);
        count
    }

    /// Remove all expired entries
    pub async fn cleanup_expired(&self) -> Vec<EvictionEvent> {
        let mut store = self.store.write().await;
        let now = Utc::now();

        let expired_keys: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        if expired_keys.is_empty() {
            return Vec::new();
        }

        for key in &expired_keys {
            store.remove(key);
        }
        store.stats.evictions_ttl += expired_keys.len() as u64;

        debug!("Cleaned up {} expired fast tier entries", expired_keys.len());
        vec![EvictionEvent::new(EvictionReason::Expired, expired_keys)]
    }

    /// Get tier statistics
    pub async fn stats(&self) -> FastTierStats {
        let store = self.store.read().await;
        FastTierStats {
            entries: store.entries.len(),
            size_bytes: store.current_size_bytes,
            ..store.stats.clone()
        }
    }

    /// Get current size in bytes
    pub async fn size_bytes(&self) -> usize {
        self.store.read().await.current_size_bytes
    }

    /// Get number of entries held (expired ones included until removed)
    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.entries.is_empty()
    }

    /// Internal: evict until an entry of `needed_size` fits under both limits
    fn evict_if_needed(&self, store: &mut FastStore, needed_size: usize) -> Vec<EvictionEvent> {
        let mut by_count = Vec::new();
        while store.entries.len() >= self.config.max_entries {
            match store.pop_lru() {
                Some(key) => by_count.push(key),
                None => break,
            }
        }
        store.stats.evictions_count += by_count.len() as u64;

        let mut by_size = Vec::new();
        while store.current_size_bytes + needed_size > self.config.max_size_bytes {
            match store.pop_lru() {
                Some(key) => by_size.push(key),
                None => break,
            }
        }
        store.stats.evictions_size += by_size.len() as u64;

        [
            (EvictionReason::EntryLimit, by_count),
            (EvictionReason::SizeLimit, by_size),
        ]
        .into_iter()
        .filter(|(_, keys)| !keys.is_empty())
        .map(|(reason, keys)| EvictionEvent::new(reason, keys))
        .collect()
    }
}

#[async_trait]
impl TierStore for FastTier {
    fn kind(&self) -> TierKind {
        TierKind::Fast
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredValue>> {
        Ok(self.lookup(key).await)
    }

    async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<()> {
        for event in self.insert(key, value, ttl).await? {
            debug!(
                "Fast tier evicted {} entries ({}) to admit {}: {:?}",
                event.len(),
                event.reason,
                key,
                event.keys
            );
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.remove(key).await;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        if prefix.is_empty() {
            return Ok(self.clear().await);
        }
        Ok(self.remove_prefix(prefix).await.len())
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(self
            .cleanup_expired()
            .await
            .iter()
            .map(EvictionEvent::len)
            .sum())
    }
}

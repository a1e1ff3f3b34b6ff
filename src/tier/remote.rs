//! Remote tier adapter
//!
//! Stands in for a shared key-value service. Clones of a [`RemoteTier`] share
//! one backing map, so several coordinators built from the same handle see
//! each other's writes the way they would through a real remote cache.

use crate::entry::{expiry_from_now, StoredValue};
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::strategy::TierKind;
use crate::tier::TierStore;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Default)]
struct RemoteState {
    entries: RwLock<HashMap<String, StoredValue>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    operations: AtomicU64,
}

/// In-process emulation of a remote key-value cache
#[derive(Clone)]
pub struct RemoteTier {
    state: Arc<RemoteState>,
}

impl Default for RemoteTier {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteTier {
    pub fn new() -> Self {
        let state = RemoteState::default();
        state.available.store(true, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    /// Add a fixed round-trip delay to every operation
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.state.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Simulate the backend going down or coming back
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("Remote tier marked unavailable");
        }
        self.state.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }

    /// Number of round trips served, failed ones included
    pub fn operation_count(&self) -> u64 {
        self.state.operations.load(Ordering::SeqCst)
    }

    /// Whether a live value is stored, bypassing latency and availability
    pub async fn contains(&self, key: &CacheKey) -> bool {
        let entries = self.state.entries.read().await;
        entries
            .get(key.as_str())
            .is_some_and(|stored| Utc::now() <= stored.expires_at)
    }

    /// Number of stored values, expired ones included until purged
    pub async fn len(&self) -> usize {
        self.state.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.entries.read().await.is_empty()
    }

    /// Internal: one simulated round trip
    async fn round_trip(&self) -> Result<()> {
        self.state.operations.fetch_add(1, Ordering::Relaxed);

        let latency = self.state.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.is_available() {
            return Err(CacheError::tier(TierKind::Remote, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl TierStore for RemoteTier {
    fn kind(&self) -> TierKind {
        TierKind::Remote
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredValue>> {
        self.round_trip().await?;

        let now = Utc::now();
        {
            let entries = self.state.entries.read().await;
            match entries.get(key.as_str()) {
                None => return Ok(None),
                Some(stored) if now <= stored.expires_at => return Ok(Some(stored.clone())),
                Some(_) => {}
            }
        }

        debug!("Remote tier entry expired: {}", key);
        let mut entries = self.state.entries.write().await;
        if entries
            .get(key.as_str())
            .is_some_and(|stored| now > stored.expires_at)
        {
            entries.remove(key.as_str());
        }
        Ok(None)
    }

    async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<()> {
        self.round_trip().await?;

        let stored = StoredValue::new(value, expiry_from_now(ttl));
        self.state
            .entries
            .write()
            .await
            .insert(key.as_str().to_string(), stored);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.round_trip().await?;
        self.state.entries.write().await.remove(key.as_str());
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.round_trip().await?;

        let mut entries = self.state.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }

    /// Drops expired values, as a real backend would on its own schedule
    async fn purge_expired(&self) -> Result<usize> {
        self.round_trip().await?;

        let mut entries = self.state.entries.write().await;
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, stored| now <= stored.expires_at);
        Ok(before - entries.len())
    }
}

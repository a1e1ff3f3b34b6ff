//! Tier stores
//!
//! Every tier satisfies the same contract:
//! - `get` on an absent or expired key returns `Ok(None)`; absence is not an error
//! - a backend failure returns `Err(CacheError::TierUnavailable { .. })`
//! - `delete_prefix("")` removes everything the tier holds
//!
//! Tiers differ only in latency, capacity and durability.

pub mod durable;
pub mod fast;
pub mod remote;

pub use durable::DurableTier;
pub use fast::FastTier;
pub use remote::RemoteTier;

use crate::entry::StoredValue;
use crate::error::Result;
use crate::key::CacheKey;
use crate::strategy::TierKind;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Uniform get/set/delete/scan-prefix contract shared by all tiers
#[async_trait]
pub trait TierStore: Send + Sync {
    /// Which position this store occupies in the hierarchy
    fn kind(&self) -> TierKind;

    /// Read a live value
    async fn get(&self, key: &CacheKey) -> Result<Option<StoredValue>>;

    /// Write a value that expires `ttl` from now
    async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<()>;

    /// Remove one key; removing an absent key succeeds
    async fn delete(&self, key: &CacheKey) -> Result<()>;

    /// Remove every key starting with `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Drop expired entries ahead of lazy expiry, returning how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}

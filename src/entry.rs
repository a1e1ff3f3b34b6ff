//! Cache entry management with TTL support

use crate::key::CacheKey;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Convert a std duration into a chrono one, saturating on overflow
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Expiry instant for a TTL starting now
pub(crate) fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    Utc::now()
        .checked_add_signed(to_chrono(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A value read from a tier together with its expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    /// Stored bytes, compressed if the strategy compresses
    pub value: Bytes,

    /// When the tier will stop returning this value
    pub expires_at: DateTime<Utc>,
}

impl StoredValue {
    pub fn new(value: Bytes, expires_at: DateTime<Utc>) -> Self {
        Self { value, expires_at }
    }

    /// Lifetime left, `None` once expired
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let now = Utc::now();
        if now > self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
        }
    }
}

/// An in-memory cache entry with TTL and metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cache key
    pub key: CacheKey,

    /// The stored value
    pub value: Bytes,

    /// Entry metadata
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    /// Create a new cache entry expiring `ttl` from now
    pub fn new(key: CacheKey, value: Bytes, ttl: Duration) -> Self {
        Self::with_expiration(key, value, expiry_from_now(ttl))
    }

    /// Create a new cache entry with custom expiration time
    pub fn with_expiration(key: CacheKey, value: Bytes, expires_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        let size_bytes = value.len();

        Self {
            key,
            value,
            metadata: EntryMetadata {
                created_at: now,
                accessed_at: now,
                expires_at,
                access_count: 0,
                size_bytes,
            },
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.metadata.expires_at
    }

    /// Mark the entry as accessed (updates access time and count)
    pub fn mark_accessed(&mut self) {
        self.metadata.accessed_at = Utc::now();
        self.metadata.access_count += 1;
    }

    /// Value and expiry as returned by a tier
    pub fn to_stored(&self) -> StoredValue {
        StoredValue::new(self.value.clone(), self.metadata.expires_at)
    }
}

/// Metadata associated with a cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// When the entry was created
    pub created_at: DateTime<Utc>,

    /// Last access time (for LRU tracking)
    pub accessed_at: DateTime<Utc>,

    /// When the entry expires
    pub expires_at: DateTime<Utc>,

    /// Number of times this entry has been read
    pub access_count: u64,

    /// Size of the stored value in bytes
    pub size_bytes: usize,
}

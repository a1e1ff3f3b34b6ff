//! Why entries leave the fast tier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason an entry was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvictionReason {
    /// TTL elapsed
    Expired,

    /// Entry count limit reached
    EntryLimit,

    /// Cumulative size limit reached
    SizeLimit,

    /// Explicit invalidation of one key
    Invalidated,

    /// Bulk prefix or full cleanup
    Cleanup,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Expired => write!(f, "TTL expired"),
            EvictionReason::EntryLimit => write!(f, "entry limit reached"),
            EvictionReason::SizeLimit => write!(f, "size limit reached"),
            EvictionReason::Invalidated => write!(f, "manual invalidation"),
            EvictionReason::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Record of a batch of removals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionEvent {
    pub reason: EvictionReason,

    pub timestamp: DateTime<Utc>,

    /// Full keys that were removed
    pub keys: Vec<String>,
}

impl EvictionEvent {
    pub fn new(reason: EvictionReason, keys: Vec<String>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            keys,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

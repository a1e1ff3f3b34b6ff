//! Error types for cache operations
//!
//! Tier-level failures are recoverable and mostly swallowed by the coordinator,
//! while generator failures always reach the caller.

use crate::strategy::TierKind;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for cache operations
///
/// `Clone` so that a single generation outcome can be handed to every caller
/// waiting on the same in-flight key.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Strategy was never registered (programmer error)
    #[error("Unknown cache strategy: {0}")]
    UnknownStrategy(String),

    /// A tier backend failed; treated as a miss on reads
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: TierKind, reason: String },

    /// The generator failed. Every follower of the same in-flight key receives
    /// this exact value.
    #[error("Generator failed for {key}: {cause}")]
    GeneratorFailure {
        key: String,
        cause: Arc<anyhow::Error>,
    },

    /// No tier accepted the value
    #[error("Failed to store {key} in any tier: {}", .failures.join("; "))]
    SetFailed { key: String, failures: Vec<String> },

    /// One or more tiers could not be cleaned
    #[error("Cache cleanup incomplete: {}", .failures.join("; "))]
    CleanupFailed { failures: Vec<String> },

    /// Value can never fit in the fast tier
    #[error("Entry of {size_bytes} bytes exceeds fast tier limit of {max_size_bytes} bytes")]
    EntryTooLarge {
        size_bytes: usize,
        max_size_bytes: usize,
    },

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Build a tier failure from any displayable backend error
    pub fn tier(tier: TierKind, reason: impl std::fmt::Display) -> Self {
        CacheError::TierUnavailable {
            tier,
            reason: reason.to_string(),
        }
    }

    /// Whether the error came from the generator rather than the cache itself
    pub fn is_generator_failure(&self) -> bool {
        matches!(self, CacheError::GeneratorFailure { .. })
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(e: serde_yaml::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

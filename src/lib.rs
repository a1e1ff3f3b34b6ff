//! # Tiered Cache (tiered-cache)
//!
//! A tiered cache coordinator for expensive generation work: AI guide text,
//! speech synthesis, geocoding and search autocompletion.
//!
//! ## Features
//!
//! - Three tiers behind one async contract: in-process fast tier, remote
//!   key-value tier, durable file tier
//! - Per-strategy policies (TTL, tiers, compression, priority) fixed at startup
//! - Single-flight generation: concurrent misses for a key run the generator once
//! - Background promotion of lower-tier hits into faster tiers
//! - Parallel fan-out writes that tolerate a degraded tier
//! - LRU eviction bounded by entry count and total bytes
//! - Lock-free statistics with per-tier hits and failures
//!
//! ## Read-through
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiered_cache::{CacheCoordinator, CacheStrategy, DurableTier, RemoteTier};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = CacheCoordinator::builder()
//!         .remote_tier(Arc::new(RemoteTier::new()))
//!         .durable_tier(Arc::new(DurableTier::open("/var/cache/guides").await?))
//!         .build()?;
//!
//!     let suggestions = coordinator
//!         .get(&CacheStrategy::SearchAutocomplete, "ko:경복궁", || async {
//!             // Call the upstream service here
//!             Ok::<_, anyhow::Error>(r#"["경복궁","남산타워"]"#)
//!         })
//!         .await?;
//!
//!     println!("{}", String::from_utf8_lossy(&suggestions));
//!     println!("{}", coordinator.stats());
//!     Ok(())
//! }
//! ```
//!
//! ## Typed access
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiered_cache::{CacheCoordinator, Coordinates, GuideCache, DurableTier, RemoteTier};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let coordinator = CacheCoordinator::builder()
//!     .remote_tier(Arc::new(RemoteTier::new()))
//!     .durable_tier(Arc::new(DurableTier::open("/var/cache/guides").await?))
//!     .build()?;
//! let cache = GuideCache::new(Arc::new(coordinator));
//!
//! let position = cache
//!     .coordinates("N Seoul Tower", || async { Ok(Coordinates::new(37.5512, 126.9882)) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod compression;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod entry;
pub mod error;
pub mod eviction;
pub mod integration;
pub mod key;
pub mod stats;
pub mod strategy;
pub mod tier;

// Re-export main types for convenience
pub use config::{CoordinatorConfig, CoordinatorConfigBuilder, FastTierConfig};
pub use coordinator::{CacheCoordinator, CacheCoordinatorBuilder};
pub use dedup::DedupRegister;
pub use entry::{CacheEntry, EntryMetadata, StoredValue};
pub use error::{CacheError, Result};
pub use eviction::{EvictionEvent, EvictionReason};
pub use integration::{Chapter, Coordinates, GuideCache};
pub use key::{normalize_subkey, CacheKey, CacheKeyBuilder};
pub use stats::{StatsCollector, StatsSnapshot, TierCounts};
pub use strategy::{
    CacheStrategy, Priority, StrategyPolicy, StrategyRegistry, StrategyTableEntry, TierKind,
};
pub use tier::fast::FastTierStats;
pub use tier::{DurableTier, FastTier, RemoteTier, TierStore};

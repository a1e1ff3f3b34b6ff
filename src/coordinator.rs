//! Cache coordinator: tier walk, promotion, single-flight generation and fan-out writes
//!
//! The coordinator is constructed once at startup with its tiers and strategy
//! table injected, then shared by handle (usually `Arc<CacheCoordinator>`).
//! Nothing about it is global.

use crate::compression;
use crate::config::CoordinatorConfig;
use crate::dedup::DedupRegister;
use crate::entry::StoredValue;
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::strategy::{CacheStrategy, StrategyPolicy, StrategyRegistry, TierKind};
use crate::tier::fast::{FastTier, FastTierStats};
use crate::tier::TierStore;
use bytes::Bytes;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Interval};
use tracing::{debug, info, warn};

/// Orchestrates reads and writes across the configured tiers
///
/// Reads walk the policy's tiers fastest first. A hit below the first tier is
/// promoted upward in the background. When every tier misses, concurrent
/// callers for the same key share one generator run through the
/// [`DedupRegister`]. Generated values are written to every policy tier in
/// parallel. Failures are never cached.
pub struct CacheCoordinator {
    registry: StrategyRegistry,
    config: CoordinatorConfig,
    fast: Arc<FastTier>,

    /// Indexed by [`TierKind::index`]
    tiers: [Option<Arc<dyn TierStore>>; 3],

    dedup: DedupRegister<Bytes, CacheError>,
    stats: Arc<StatsCollector>,
}

impl CacheCoordinator {
    pub fn builder() -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder::default()
    }

    /// Read through the cache, generating on a full miss
    ///
    /// `generator` runs at most once per in-flight episode for the key, no
    /// matter how many callers ask concurrently. Its error reaches every
    /// waiting caller and nothing is stored.
    pub async fn get<F, Fut, V>(
        &self,
        strategy: &CacheStrategy,
        subkey: &str,
        generator: F,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
        V: Into<Bytes>,
    {
        let policy = self.registry.resolve(strategy)?;
        let key = CacheKey::new(strategy.clone(), subkey);

        let started = Instant::now();
        self.stats.record_request();

        let result = self.get_resolved(&key, policy, generator).await;

        self.stats.record_response_time(started.elapsed());
        result
    }

    async fn get_resolved<F, Fut, V>(
        &self,
        key: &CacheKey,
        policy: &StrategyPolicy,
        generator: F,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
        V: Into<Bytes>,
    {
        if let Some((tier, value)) = self.lookup(key, policy).await {
            self.stats.record_hit(tier);
            return Ok(value);
        }

        debug!("Cache miss: {}", key);
        self.stats.record_miss();

        let (result, was_leader) = self
            .dedup
            .run(key.as_str(), || self.generate(key, policy, generator))
            .await;

        if !was_leader {
            self.stats.record_dedup_follower();
        }
        result
    }

    /// Internal: walk the policy tiers in order and return the first hit
    async fn lookup(&self, key: &CacheKey, policy: &StrategyPolicy) -> Option<(TierKind, Bytes)> {
        let tiers = self.policy_tiers(policy);

        for (position, tier) in tiers.iter().enumerate() {
            if let Some((stored, value)) = self.read_tier(tier, key, policy.compress).await {
                debug!("Cache hit in {} tier: {}", tier.kind(), key);
                if position > 0 {
                    self.promote(key, stored, tiers[..position].to_vec());
                }
                return Some((tier.kind(), value));
            }
        }

        None
    }

    /// Internal: read and decode one tier, treating every failure as a miss
    async fn read_tier(
        &self,
        tier: &Arc<dyn TierStore>,
        key: &CacheKey,
        compressed: bool,
    ) -> Option<(StoredValue, Bytes)> {
        match tier.get(key).await {
            Ok(Some(stored)) => match compression::decode(stored.value.clone(), compressed) {
                Ok(value) => Some((stored, value)),
                Err(e) => {
                    warn!("Discarding undecodable {} tier entry {}: {}", tier.kind(), key, e);
                    if let Err(e) = tier.delete(key).await {
                        warn!("Failed to remove undecodable entry {}: {}", key, e);
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Read from {} tier failed for {}: {}", tier.kind(), key, e);
                self.stats.record_tier_failure(tier.kind());
                None
            }
        }
    }

    /// Internal: leader side of a miss
    async fn generate<F, Fut, V>(
        &self,
        key: &CacheKey,
        policy: &StrategyPolicy,
        generator: F,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
        V: Into<Bytes>,
    {
        // A previous episode may have finished between our miss and now
        if let Some(first) = self.policy_tiers(policy).first() {
            if let Some((_, value)) = self.read_tier(first, key, policy.compress).await {
                debug!("Value for {} landed while waiting to generate", key);
                return Ok(value);
            }
        }

        self.stats.record_generator_call();
        let value: Bytes = match generator().await {
            Ok(value) => value.into(),
            Err(cause) => {
                self.stats.record_generator_failure();
                warn!("Generator failed for {}: {:#}", key, cause);
                return Err(CacheError::GeneratorFailure {
                    key: key.to_string(),
                    cause: Arc::new(cause),
                });
            }
        };

        if let Err(e) = self.store(key, policy, value.clone()).await {
            warn!("Generated value for {} was not cached: {}", key, e);
        }
        Ok(value)
    }

    /// Internal: write `value` back into every faster tier, detached from the caller
    fn promote(&self, key: &CacheKey, stored: StoredValue, targets: Vec<Arc<dyn TierStore>>) {
        let Some(ttl) = stored.remaining_ttl() else {
            return;
        };

        let key = key.clone();
        let stats = Arc::clone(&self.stats);
        let deadline = self.config.promotion_timeout;

        tokio::spawn(async move {
            let writes = targets.iter().map(|tier| {
                let value = stored.value.clone();
                let key = &key;
                async move {
                    let outcome = tokio::time::timeout(deadline, tier.set(key, value, ttl)).await;
                    (tier.kind(), outcome)
                }
            });

            for (kind, outcome) in join_all(writes).await {
                match outcome {
                    Ok(Ok(())) => {
                        debug!("Promoted {} into {} tier", key, kind);
                        stats.record_promotion(true);
                    }
                    Ok(Err(e)) => {
                        warn!("Promotion of {} into {} tier failed: {}", key, kind, e);
                        stats.record_promotion(false);
                    }
                    Err(_) => {
                        warn!("Promotion of {} into {} tier timed out after {:?}", key, kind, deadline);
                        stats.record_promotion(false);
                    }
                }
            }
        });
    }

    /// Write a value into every tier of the strategy's policy
    ///
    /// Succeeds when at least one tier accepted the value.
    pub async fn set(
        &self,
        strategy: &CacheStrategy,
        subkey: &str,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        let policy = self.registry.resolve(strategy)?;
        let key = CacheKey::new(strategy.clone(), subkey);
        self.store(&key, policy, value.into()).await
    }

    /// Internal: compress and fan out to the policy tiers
    async fn store(&self, key: &CacheKey, policy: &StrategyPolicy, value: Bytes) -> Result<()> {
        let encoded = compression::encode(value, policy.compress)?;
        let tiers = self.policy_tiers(policy);

        let writes = tiers.iter().map(|tier| {
            let encoded = encoded.clone();
            async move { (tier.kind(), tier.set(key, encoded, policy.ttl).await) }
        });

        let mut failures = Vec::new();
        for (kind, result) in join_all(writes).await {
            if let Err(e) = result {
                warn!("Write to {} tier failed for {}: {}", kind, key, e);
                if !matches!(e, CacheError::EntryTooLarge { .. }) {
                    self.stats.record_tier_failure(kind);
                }
                failures.push(format!("{}: {}", kind, e));
            }
        }

        let stored_any = failures.len() < tiers.len();
        self.stats.record_set(stored_any);

        if stored_any {
            debug!("Stored {} in {} of {} tiers", key, tiers.len() - failures.len(), tiers.len());
            Ok(())
        } else {
            Err(CacheError::SetFailed {
                key: key.to_string(),
                failures,
            })
        }
    }

    /// Delete a key from every tier of the strategy's policy
    ///
    /// Best effort: a tier that fails to delete is logged and the entry is left
    /// to expire.
    pub async fn invalidate(&self, strategy: &CacheStrategy, subkey: &str) -> Result<()> {
        let policy = self.registry.resolve(strategy)?;
        let key = CacheKey::new(strategy.clone(), subkey);
        let tiers = self.policy_tiers(policy);

        let deletes = tiers.iter().map(|tier| {
            let key = &key;
            async move { (tier.kind(), tier.delete(key).await) }
        });

        for (kind, result) in join_all(deletes).await {
            if let Err(e) = result {
                warn!("Delete from {} tier failed for {}: {}", kind, key, e);
                self.stats.record_tier_failure(kind);
            }
        }

        self.stats.record_invalidation();
        debug!("Invalidated {}", key);
        Ok(())
    }

    /// Bulk removal for administration
    ///
    /// With a strategy, removes that strategy's namespace from its tiers.
    /// Without one, clears every configured tier. Every tier is attempted;
    /// returns the number of entries removed.
    pub async fn cleanup(&self, strategy: Option<&CacheStrategy>) -> Result<usize> {
        let (prefix, tiers) = match strategy {
            Some(strategy) => {
                let policy = self.registry.resolve(strategy)?;
                (strategy.key_prefix(), self.policy_tiers(policy))
            }
            None => (String::new(), self.tiers.iter().flatten().cloned().collect()),
        };

        let prefix = prefix.as_str();
        let sweeps = tiers.iter().map(|tier| async move {
            (tier.kind(), tier.delete_prefix(prefix).await)
        });

        let mut removed = 0;
        let mut failures = Vec::new();
        for (kind, result) in join_all(sweeps).await {
            match result {
                Ok(count) => removed += count,
                Err(e) => {
                    warn!("Cleanup of {} tier failed: {}", kind, e);
                    self.stats.record_tier_failure(kind);
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }

        match strategy {
            Some(strategy) => info!("Cleaned up {} entries for {}", removed, strategy),
            None => info!("Cleaned up {} entries across all tiers", removed),
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(CacheError::CleanupFailed { failures })
        }
    }

    /// Typed read-through: values are stored as JSON
    pub async fn get_json<T, F, Fut>(
        &self,
        strategy: &CacheStrategy,
        subkey: &str,
        generator: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let bytes = self
            .get(strategy, subkey, || async move {
                let value = generator().await?;
                Ok::<_, anyhow::Error>(serde_json::to_vec(&value)?)
            })
            .await?;

        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Typed write: the value is stored as JSON
    pub async fn set_json<T: Serialize>(
        &self,
        strategy: &CacheStrategy,
        subkey: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(strategy, subkey, bytes).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn fast_tier_stats(&self) -> FastTierStats {
        self.fast.stats().await
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn fast_tier(&self) -> &Arc<FastTier> {
        &self.fast
    }

    /// Number of keys currently being generated
    pub fn in_flight_count(&self) -> usize {
        self.dedup.in_flight_count()
    }

    /// Start the background expiry sweep over every configured tier and the
    /// stats log
    ///
    /// Returns `None` when both are disabled. The task runs until its handle
    /// is aborted.
    pub fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        let sweep_every = self
            .config
            .enable_auto_cleanup
            .then_some(self.config.cleanup_interval);
        let log_every = self.config.stats_log_interval;

        if sweep_every.is_none() && log_every.is_none() {
            return None;
        }

        let tiers: Vec<Arc<dyn TierStore>> = self.tiers.iter().flatten().cloned().collect();
        let stats = Arc::clone(&self.stats);

        info!(
            "Starting cache maintenance (sweep: {:?}, stats log: {:?})",
            sweep_every, log_every
        );

        Some(tokio::spawn(async move {
            let mut sweep_timer = sweep_every.map(delayed_interval);
            let mut log_timer = log_every.map(delayed_interval);

            loop {
                tokio::select! {
                    _ = tick(&mut sweep_timer) => {
                        for tier in &tiers {
                            match tier.purge_expired().await {
                                Ok(0) => {}
                                Ok(removed) => {
                                    info!("Expiry sweep removed {} {} tier entries", removed, tier.kind())
                                }
                                Err(e) => warn!("Expiry sweep of {} tier failed: {}", tier.kind(), e),
                            }
                        }
                    }
                    _ = tick(&mut log_timer) => {
                        info!("{}", stats.snapshot());
                    }
                }
            }
        }))
    }

    /// Internal: the configured stores for a policy, in policy order
    fn policy_tiers(&self, policy: &StrategyPolicy) -> Vec<Arc<dyn TierStore>> {
        policy
            .tiers
            .iter()
            .filter_map(|tier| self.tiers[tier.index()].clone())
            .collect()
    }
}

fn delayed_interval(period: Duration) -> Interval {
    interval_at(tokio::time::Instant::now() + period, period)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Builder for [`CacheCoordinator`]
///
/// A fast tier is created from the config unless one is supplied. Remote and
/// durable tiers must be supplied when any registered policy uses them.
#[derive(Default)]
pub struct CacheCoordinatorBuilder {
    registry: Option<StrategyRegistry>,
    config: Option<CoordinatorConfig>,
    fast: Option<Arc<FastTier>>,
    remote: Option<Arc<dyn TierStore>>,
    durable: Option<Arc<dyn TierStore>>,
}

impl CacheCoordinatorBuilder {
    /// Strategy table; defaults to [`StrategyRegistry::default`]
    pub fn registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Share an existing fast tier instead of creating one
    pub fn fast_tier(mut self, fast: Arc<FastTier>) -> Self {
        self.fast = Some(fast);
        self
    }

    pub fn remote_tier(mut self, remote: Arc<dyn TierStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn durable_tier(mut self, durable: Arc<dyn TierStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn build(self) -> Result<CacheCoordinator> {
        let registry = self.registry.unwrap_or_default();
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let fast = self
            .fast
            .unwrap_or_else(|| Arc::new(FastTier::new(config.fast.clone())));

        let mut tiers: [Option<Arc<dyn TierStore>>; 3] = [None, None, None];
        tiers[TierKind::Fast.index()] = Some(fast.clone() as Arc<dyn TierStore>);
        tiers[TierKind::Remote.index()] = self.remote;
        tiers[TierKind::Durable.index()] = self.durable;

        for (slot, tier) in TierKind::ALL.into_iter().zip(tiers.iter()) {
            if let Some(store) = tier {
                if store.kind() != slot {
                    return Err(CacheError::ConfigError(format!(
                        "{} tier supplied where the {} tier was expected",
                        store.kind(),
                        slot
                    )));
                }
            }
        }

        for required in registry.required_tiers() {
            if tiers[required.index()].is_none() {
                return Err(CacheError::ConfigError(format!(
                    "a registered strategy uses the {} tier but none was configured",
                    required
                )));
            }
        }

        info!(
            "Cache coordinator ready: {} strategies, tiers {:?}",
            registry.len(),
            TierKind::ALL
                .into_iter()
                .filter(|tier| tiers[tier.index()].is_some())
                .collect::<Vec<_>>()
        );

        Ok(CacheCoordinator {
            registry,
            config,
            fast,
            tiers,
            dedup: DedupRegister::new(),
            stats: Arc::new(StatsCollector::new()),
        })
    }
}

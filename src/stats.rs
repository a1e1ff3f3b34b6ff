//! Statistics for cache performance monitoring
//!
//! Counters only ever increase. A [`StatsSnapshot`] is rebuilt from them on
//! demand, so readers never block writers and no lock is held across I/O.

use crate::strategy::TierKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters kept per tier
#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    failures: AtomicU64,
}

/// Lock-free counters shared by the coordinator
#[derive(Debug, Default)]
pub struct StatsCollector {
    total_requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    tiers: [TierCounters; 3],
    generator_calls: AtomicU64,
    generator_failures: AtomicU64,
    dedup_followers: AtomicU64,
    promotions: AtomicU64,
    promotion_failures: AtomicU64,
    sets: AtomicU64,
    set_failures: AtomicU64,
    invalidations: AtomicU64,
    completed_gets: AtomicU64,
    total_response_micros: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self, tier: TierKind) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.tiers[tier.index()].hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A backend error, kept apart from logical misses
    pub fn record_tier_failure(&self, tier: TierKind) {
        self.tiers[tier.index()].failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generator_call(&self) {
        self.generator_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generator_failure(&self) {
        self.generator_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller that waited on another caller's generation
    pub fn record_dedup_follower(&self) {
        self.dedup_followers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self, succeeded: bool) {
        if succeeded {
            self.promotions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.promotion_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_set(&self, succeeded: bool) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.set_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished `get` into the running average response time
    pub fn record_response_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_response_micros.fetch_add(micros, Ordering::Relaxed);
        self.completed_gets.fetch_add(1, Ordering::Relaxed);
    }

    /// Build a snapshot from the current counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let total_requests = load(&self.total_requests);
        let hits = load(&self.hits);
        let completed = load(&self.completed_gets);
        let total_micros = load(&self.total_response_micros);

        let tier_hits = |tier: TierKind| load(&self.tiers[tier.index()].hits);
        let tier_failures = |tier: TierKind| load(&self.tiers[tier.index()].failures);

        StatsSnapshot {
            total_requests,
            hits,
            misses: load(&self.misses),
            hit_rate: ratio(hits, total_requests),
            hits_by_tier: TierCounts {
                fast: tier_hits(TierKind::Fast),
                remote: tier_hits(TierKind::Remote),
                durable: tier_hits(TierKind::Durable),
            },
            tier_failures: TierCounts {
                fast: tier_failures(TierKind::Fast),
                remote: tier_failures(TierKind::Remote),
                durable: tier_failures(TierKind::Durable),
            },
            avg_response_time_ms: if completed == 0 {
                0.0
            } else {
                total_micros as f64 / completed as f64 / 1000.0
            },
            generator_calls: load(&self.generator_calls),
            generator_failures: load(&self.generator_failures),
            dedup_followers: load(&self.dedup_followers),
            promotions: load(&self.promotions),
            promotion_failures: load(&self.promotion_failures),
            sets: load(&self.sets),
            set_failures: load(&self.set_failures),
            invalidations: load(&self.invalidations),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// One counter per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub fast: u64,
    pub remote: u64,
    pub durable: u64,
}

impl TierCounts {
    pub fn get(&self, tier: TierKind) -> u64 {
        match tier {
            TierKind::Fast => self.fast,
            TierKind::Remote => self.remote,
            TierKind::Durable => self.durable,
        }
    }

    pub fn total(&self) -> u64 {
        self.fast + self.remote + self.durable
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,

    /// `hits / total_requests`, 0 when there were no requests
    pub hit_rate: f64,

    pub hits_by_tier: TierCounts,

    /// Backend errors per tier; a degraded tier shows up here, not as misses
    pub tier_failures: TierCounts,

    /// Mean wall time of completed `get` calls
    pub avg_response_time_ms: f64,

    pub generator_calls: u64,
    pub generator_failures: u64,

    /// Calls served by another caller's in-flight generation
    pub dedup_followers: u64,

    pub promotions: u64,
    pub promotion_failures: u64,
    pub sets: u64,
    pub set_failures: u64,
    pub invalidations: u64,
}

impl StatsSnapshot {
    /// Whether any tier has reported a backend failure
    pub fn is_degraded(&self) -> bool {
        self.tier_failures.total() > 0
    }

    pub fn miss_rate(&self) -> f64 {
        ratio(self.misses, self.total_requests)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ requests: {}, hits: {} (fast {}, remote {}, durable {}), misses: {}, hit_rate: {:.1}%, avg_response: {:.2}ms, generator_calls: {}, dedup_followers: {}, tier_failures: {} }}",
            self.total_requests,
            self.hits,
            self.hits_by_tier.fast,
            self.hits_by_tier.remote,
            self.hits_by_tier.durable,
            self.misses,
            self.hit_rate * 100.0,
            self.avg_response_time_ms,
            self.generator_calls,
            self.dedup_followers,
            self.tier_failures.total()
        )
    }
}

//! Cache strategies and their policies
//!
//! A [`StrategyRegistry`] is built once at startup, either from the built-in
//! table or from a YAML table, and is read-only afterwards.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Named cache strategy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CacheStrategy {
    /// Search box suggestions
    SearchAutocomplete,

    /// Full AI guide text for a location
    GuideGeneration,

    /// Merged results from external data sources
    DataIntegration,

    /// Geocoding and place coordinate lookups
    CoordinateEnhancement,

    /// Per-chapter guide generation (text and audio scripts)
    ChapterGeneration,

    /// Strategy defined by a loaded registry table
    ///
    /// Build it with [`CacheStrategy::custom`] or `parse` so the name is
    /// checked; registries reject unchecked names.
    Custom(String),
}

impl CacheStrategy {
    /// All built-in strategies
    pub const BUILTIN: [CacheStrategy; 5] = [
        CacheStrategy::SearchAutocomplete,
        CacheStrategy::GuideGeneration,
        CacheStrategy::DataIntegration,
        CacheStrategy::CoordinateEnhancement,
        CacheStrategy::ChapterGeneration,
    ];

    /// Stable identifier, also used as the key namespace
    pub fn as_str(&self) -> &str {
        match self {
            CacheStrategy::SearchAutocomplete => "search_autocomplete",
            CacheStrategy::GuideGeneration => "guide_generation",
            CacheStrategy::DataIntegration => "data_integration",
            CacheStrategy::CoordinateEnhancement => "coordinate_enhancement",
            CacheStrategy::ChapterGeneration => "chapter_generation",
            CacheStrategy::Custom(name) => name,
        }
    }

    /// Key prefix covering every entry of this strategy
    pub fn key_prefix(&self) -> String {
        format!("{}:", self.as_str())
    }

    /// Checked constructor for a table-defined strategy
    ///
    /// The name becomes the key namespace, so it must be non-empty, free of
    /// `:` and distinct from every built-in name.
    pub fn custom(name: impl Into<String>) -> Result<Self> {
        let strategy = CacheStrategy::Custom(name.into());
        strategy.validate()?;
        Ok(strategy)
    }

    /// Check that the key namespace of this strategy is well formed
    pub fn validate(&self) -> Result<()> {
        let CacheStrategy::Custom(name) = self else {
            return Ok(());
        };

        if name.trim().is_empty() {
            return Err(CacheError::ConfigError(
                "strategy name must not be empty".to_string(),
            ));
        }
        if name.contains(':') {
            return Err(CacheError::ConfigError(format!(
                "strategy name must not contain ':': {}",
                name
            )));
        }
        if name.trim() != name {
            return Err(CacheError::ConfigError(format!(
                "strategy name must not have surrounding whitespace: {:?}",
                name
            )));
        }
        if CacheStrategy::BUILTIN.iter().any(|b| b.as_str() == name) {
            return Err(CacheError::ConfigError(format!(
                "custom strategy shadows a built-in one: {}",
                name
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for CacheStrategy {
    type Error = CacheError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CacheStrategy> for String {
    fn from(strategy: CacheStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

impl FromStr for CacheStrategy {
    type Err = CacheError;

    /// Built-in names map to their variant, anything else becomes a checked
    /// [`CacheStrategy::Custom`]
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match CacheStrategy::BUILTIN.into_iter().find(|b| b.as_str() == s) {
            Some(builtin) => Ok(builtin),
            None => CacheStrategy::custom(s),
        }
    }
}

/// A backing store in the hierarchy, ordered fastest to slowest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// In-process LRU memory
    Fast,
    /// Shared remote key-value service
    Remote,
    /// Disk or database backed store
    Durable,
}

impl TierKind {
    pub const ALL: [TierKind; 3] = [TierKind::Fast, TierKind::Remote, TierKind::Durable];

    /// Position in the hierarchy, 0 is fastest
    pub fn index(self) -> usize {
        match self {
            TierKind::Fast => 0,
            TierKind::Remote => 1,
            TierKind::Durable => 2,
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::Fast => write!(f, "fast"),
            TierKind::Remote => write!(f, "remote"),
            TierKind::Durable => write!(f, "durable"),
        }
    }
}

/// Priority class of a strategy
///
/// Only an observability hint. It never changes admission, eviction order or
/// scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Policy bound to a strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyPolicy {
    /// Time-to-live for every tier
    pub ttl: Duration,

    /// Tiers to use, fastest first
    pub tiers: Vec<TierKind>,

    /// Gzip values before storing them
    pub compress: bool,

    /// Observability hint
    pub priority: Priority,
}

impl StrategyPolicy {
    /// Create a policy, validating the tier order
    pub fn new(
        ttl: Duration,
        tiers: Vec<TierKind>,
        compress: bool,
        priority: Priority,
    ) -> Result<Self> {
        let policy = Self {
            ttl,
            tiers,
            compress,
            priority,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Check the policy invariants: non-empty, strictly fastest-to-slowest
    /// (which also puts Fast first) and a non-zero TTL
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(CacheError::ConfigError(
                "policy must name at least one tier".to_string(),
            ));
        }

        if self.tiers.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(CacheError::ConfigError(format!(
                "tiers must be unique and ordered fastest to slowest: {:?}",
                self.tiers
            )));
        }

        if self.ttl.is_zero() {
            return Err(CacheError::ConfigError("ttl must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// Whether this policy writes to the given tier
    pub fn uses(&self, tier: TierKind) -> bool {
        self.tiers.contains(&tier)
    }
}

/// One row of a strategy table as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyTableEntry {
    pub strategy: String,
    pub ttl_secs: u64,
    pub tiers: Vec<TierKind>,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Deserialize)]
struct StrategyTable {
    strategies: Vec<StrategyTableEntry>,
}

/// Immutable mapping from strategy to policy
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    policies: HashMap<CacheStrategy, StrategyPolicy>,
}

impl StrategyRegistry {
    /// Build a registry from table rows
    pub fn from_entries(entries: Vec<StrategyTableEntry>) -> Result<Self> {
        let mut policies = HashMap::with_capacity(entries.len());

        for entry in entries {
            let strategy: CacheStrategy = entry.strategy.parse()?;
            let policy = StrategyPolicy::new(
                Duration::from_secs(entry.ttl_secs),
                entry.tiers,
                entry.compress,
                entry.priority,
            )
            .map_err(|e| CacheError::ConfigError(format!("strategy {}: {}", strategy, e)))?;

            register(&mut policies, strategy, policy)?;
        }

        if policies.is_empty() {
            return Err(CacheError::ConfigError(
                "strategy table must not be empty".to_string(),
            ));
        }

        info!("Strategy registry initialized with {} strategies", policies.len());
        Ok(Self { policies })
    }

    /// Build a registry from already-validated policies
    pub fn from_policies(
        policies: impl IntoIterator<Item = (CacheStrategy, StrategyPolicy)>,
    ) -> Result<Self> {
        let mut map = HashMap::new();
        for (strategy, policy) in policies {
            strategy.validate()?;
            policy
                .validate()
                .map_err(|e| CacheError::ConfigError(format!("strategy {}: {}", strategy, e)))?;
            register(&mut map, strategy, policy)?;
        }
        Ok(Self { policies: map })
    }

    /// Parse a YAML table of the form `strategies: [{strategy, ttl_secs, tiers, compress, priority}]`
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: StrategyTable = serde_yaml::from_str(yaml)?;
        Self::from_entries(table.strategies)
    }

    /// Load a YAML strategy table from disk
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!("Loading strategy table from {}", path.display());
        Self::from_yaml(&content)
    }

    /// Resolve the policy for a strategy
    pub fn resolve(&self, strategy: &CacheStrategy) -> Result<&StrategyPolicy> {
        self.policies
            .get(strategy)
            .ok_or_else(|| CacheError::UnknownStrategy(strategy.to_string()))
    }

    /// Registered strategies with their policies, sorted by name
    pub fn iter(&self) -> impl Iterator<Item = (&CacheStrategy, &StrategyPolicy)> {
        let mut rows: Vec<_> = self.policies.iter().collect();
        rows.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        rows.into_iter()
    }

    /// Every tier referenced by at least one policy
    pub fn required_tiers(&self) -> Vec<TierKind> {
        TierKind::ALL
            .into_iter()
            .filter(|tier| self.policies.values().any(|p| p.uses(*tier)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Insert a policy, refusing a second strategy with the same key namespace
fn register(
    policies: &mut HashMap<CacheStrategy, StrategyPolicy>,
    strategy: CacheStrategy,
    policy: StrategyPolicy,
) -> Result<()> {
    if policies.keys().any(|s| s.as_str() == strategy.as_str()) {
        return Err(CacheError::ConfigError(format!(
            "strategy registered twice: {}",
            strategy
        )));
    }
    policies.insert(strategy, policy);
    Ok(())
}

impl Default for StrategyRegistry {
    /// The production table
    fn default() -> Self {
        use TierKind::{Durable, Fast, Remote};

        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;

        let table = [
            (CacheStrategy::SearchAutocomplete, 30 * MINUTE, vec![Fast, Remote], true, Priority::High),
            (CacheStrategy::GuideGeneration, 6 * HOUR, vec![Fast, Remote, Durable], true, Priority::High),
            (CacheStrategy::DataIntegration, 2 * HOUR, vec![Fast, Remote], true, Priority::Medium),
            (CacheStrategy::CoordinateEnhancement, 12 * HOUR, vec![Fast, Remote, Durable], false, Priority::Medium),
            (CacheStrategy::ChapterGeneration, 4 * HOUR, vec![Fast, Remote], true, Priority::High),
        ];

        let policies = table
            .into_iter()
            .map(|(strategy, ttl_secs, tiers, compress, priority)| {
                (
                    strategy,
                    StrategyPolicy {
                        ttl: Duration::from_secs(ttl_secs),
                        tiers,
                        compress,
                        priority,
                    },
                )
            })
            .collect();

        Self { policies }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_registry() {
        let registry = StrategyRegistry::default();
        assert_eq!(registry.len(), 5);

        let policy = registry.resolve(&CacheStrategy::SearchAutocomplete).unwrap();
        assert_eq!(policy.ttl, Duration::from_secs(30 * 60));
        assert_eq!(policy.tiers, vec![TierKind::Fast, TierKind::Remote]);
        assert!(policy.compress);
        assert_eq!(policy.priority, Priority::High);

        let policy = registry.resolve(&CacheStrategy::CoordinateEnhancement).unwrap();
        assert!(!policy.compress);
        assert!(policy.uses(TierKind::Durable));

        for (_, policy) in registry.iter() {
            assert!(policy.validate().is_ok());
        }
    }

    #[test]
    fn test_unknown_strategy() {
        let registry = StrategyRegistry::default();
        let err = registry
            .resolve(&CacheStrategy::Custom("weather".to_string()))
            .unwrap_err();
        assert!(matches!(err, CacheError::UnknownStrategy(name) if name == "weather"));
    }

    #[test]
    fn test_policy_validation() {
        let ttl = Duration::from_secs(60);

        assert!(StrategyPolicy::new(ttl, vec![], false, Priority::Low).is_err());
        assert!(StrategyPolicy::new(ttl, vec![TierKind::Remote, TierKind::Fast], false, Priority::Low).is_err());
        assert!(StrategyPolicy::new(ttl, vec![TierKind::Fast, TierKind::Fast], false, Priority::Low).is_err());
        assert!(StrategyPolicy::new(Duration::ZERO, vec![TierKind::Fast], false, Priority::Low).is_err());

        assert!(StrategyPolicy::new(ttl, vec![TierKind::Remote, TierKind::Durable], false, Priority::Low).is_ok());
        assert!(StrategyPolicy::new(ttl, vec![TierKind::Fast, TierKind::Durable], true, Priority::High).is_ok());
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in CacheStrategy::BUILTIN {
            let parsed: CacheStrategy = strategy.as_str().parse().unwrap();
            assert_eq!(parsed, strategy);
        }

        let custom: CacheStrategy = "tts_audio".parse().unwrap();
        assert_eq!(custom, CacheStrategy::Custom("tts_audio".to_string()));
        assert_eq!(custom.key_prefix(), "tts_audio:");

        assert!("bad:name".parse::<CacheStrategy>().is_err());
        assert!("  ".parse::<CacheStrategy>().is_err());
    }

    #[test]
    fn test_custom_names_are_checked() {
        assert_ok!(CacheStrategy::custom("tts_audio"));

        assert_err!(CacheStrategy::custom(""));
        assert_err!(CacheStrategy::custom("tts:ko"));
        assert_err!(CacheStrategy::custom(" tts"));
        for builtin in CacheStrategy::BUILTIN {
            assert_err!(CacheStrategy::custom(builtin.as_str()));
        }

        // Parsing a built-in name still yields the built-in variant
        let parsed: CacheStrategy = "guide_generation".parse().unwrap();
        assert_eq!(parsed, CacheStrategy::GuideGeneration);
    }

    #[test]
    fn test_strategy_deserialize_rejects_bad_names() {
        let ok: CacheStrategy = serde_json::from_str("\"chapter_generation\"").unwrap();
        assert_eq!(ok, CacheStrategy::ChapterGeneration);

        assert_err!(serde_json::from_str::<CacheStrategy>("\"tts:ko\""));
        assert_err!(serde_json::from_str::<CacheStrategy>("\"\""));
    }

    #[test]
    fn test_from_policies_rejects_shared_namespaces() {
        let policy =
            StrategyPolicy::new(Duration::from_secs(60), vec![TierKind::Fast], false, Priority::Low)
                .unwrap();

        // Same namespace as a built-in, under a different compress policy
        let shadow = StrategyRegistry::from_policies([
            (CacheStrategy::GuideGeneration, policy.clone()),
            (CacheStrategy::Custom("guide_generation".to_string()), policy.clone()),
        ]);
        assert!(matches!(shadow, Err(CacheError::ConfigError(_))));

        // A name with ':' would sit inside another strategy's prefix
        let nested = StrategyRegistry::from_policies([
            (CacheStrategy::Custom("tts".to_string()), policy.clone()),
            (CacheStrategy::Custom("tts:ko".to_string()), policy.clone()),
        ]);
        assert!(matches!(nested, Err(CacheError::ConfigError(_))));

        let empty =
            StrategyRegistry::from_policies([(CacheStrategy::Custom(String::new()), policy.clone())]);
        assert!(empty.is_err());

        let fine = StrategyRegistry::from_policies([
            (CacheStrategy::GuideGeneration, policy.clone()),
            (CacheStrategy::custom("tts").unwrap(), policy),
        ])
        .unwrap();
        assert_eq!(fine.len(), 2);
    }

    #[test]
    fn test_registry_from_yaml() {
        let yaml = r#"
strategies:
  - strategy: search_autocomplete
    ttl_secs: 1800
    tiers: [fast, remote]
    compress: true
    priority: high
  - strategy: tts_audio
    ttl_secs: 86400
    tiers: [fast, durable]
"#;

        let registry = StrategyRegistry::from_yaml(yaml).unwrap();
        assert_eq!(registry.len(), 2);

        let tts = registry
            .resolve(&CacheStrategy::Custom("tts_audio".to_string()))
            .unwrap();
        assert_eq!(tts.tiers, vec![TierKind::Fast, TierKind::Durable]);
        assert!(!tts.compress);
        assert_eq!(tts.priority, Priority::Medium);

        assert_eq!(
            registry.required_tiers(),
            vec![TierKind::Fast, TierKind::Remote, TierKind::Durable]
        );
    }

    #[test]
    fn test_registry_rejects_bad_tables() {
        let duplicate = r#"
strategies:
  - { strategy: a, ttl_secs: 10, tiers: [fast] }
  - { strategy: a, ttl_secs: 20, tiers: [fast] }
"#;
        assert!(StrategyRegistry::from_yaml(duplicate).is_err());

        let misordered = r#"
strategies:
  - { strategy: a, ttl_secs: 10, tiers: [durable, fast] }
"#;
        assert!(StrategyRegistry::from_yaml(misordered).is_err());

        assert!(StrategyRegistry::from_yaml("strategies: []").is_err());
    }

    #[test]
    fn test_tier_kind_display() {
        assert_eq!(TierKind::Fast.to_string(), "fast");
        assert_eq!(TierKind::Remote.to_string(), "remote");
        assert_eq!(TierKind::Durable.to_string(), "durable");
        assert!(TierKind::Fast < TierKind::Durable);
    }
}

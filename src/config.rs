//! Configuration for the fast tier and the coordinator

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Limits for the in-process fast tier
///
/// Defaults mirror the production memory cache: 10,000 entries, 1 GiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastTierConfig {
    /// Maximum number of entries
    pub max_entries: usize,

    /// Maximum cumulative size of stored values in bytes
    pub max_size_bytes: usize,
}

impl Default for FastTierConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_size_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl FastTierConfig {
    pub fn new(max_entries: usize, max_size_bytes: usize) -> Self {
        Self {
            max_entries,
            max_size_bytes,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::ConfigError(
                "max_entries must be greater than 0".to_string(),
            ));
        }

        if self.max_size_bytes == 0 {
            return Err(CacheError::ConfigError(
                "max_size_bytes must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Coordinator configuration, fixed at process start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Fast tier limits
    pub fast: FastTierConfig,

    /// Deadline for detached promotion writes
    pub promotion_timeout: Duration,

    /// Run the periodic fast-tier expiry sweep
    pub enable_auto_cleanup: bool,

    /// Interval between expiry sweeps
    pub cleanup_interval: Duration,

    /// Log a stats snapshot at this interval, if set
    pub stats_log_interval: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fast: FastTierConfig::default(),
            promotion_timeout: Duration::from_secs(2),
            enable_auto_cleanup: true,
            // Sweep every 5 minutes
            cleanup_interval: Duration::from_secs(300),
            stats_log_interval: None,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new builder for coordinator configuration
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.fast.validate()?;

        if self.promotion_timeout.is_zero() {
            return Err(CacheError::ConfigError(
                "promotion_timeout must be greater than 0".to_string(),
            ));
        }

        if self.enable_auto_cleanup && self.cleanup_interval.is_zero() {
            return Err(CacheError::ConfigError(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }

        if matches!(self.stats_log_interval, Some(interval) if interval.is_zero()) {
            return Err(CacheError::ConfigError(
                "stats_log_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load overrides from the environment (and `.env` if present)
    ///
    /// Recognised variables: `TIERED_CACHE_FAST_MAX_ENTRIES`,
    /// `TIERED_CACHE_FAST_MAX_BYTES`, `TIERED_CACHE_PROMOTION_TIMEOUT_MS`,
    /// `TIERED_CACHE_SWEEP_INTERVAL_SECS` (0 disables the sweep) and
    /// `TIERED_CACHE_STATS_LOG_INTERVAL_SECS`.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(v) = parse_var::<usize>(&lookup, "TIERED_CACHE_FAST_MAX_ENTRIES")? {
            builder = builder.max_entries(v);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "TIERED_CACHE_FAST_MAX_BYTES")? {
            builder = builder.max_size_bytes(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "TIERED_CACHE_PROMOTION_TIMEOUT_MS")? {
            builder = builder.promotion_timeout(Duration::from_millis(v));
        }
        if let Some(v) = parse_var::<u64>(&lookup, "TIERED_CACHE_SWEEP_INTERVAL_SECS")? {
            builder = if v == 0 {
                builder.enable_auto_cleanup(false)
            } else {
                builder.cleanup_interval(Duration::from_secs(v))
            };
        }
        if let Some(v) = parse_var::<u64>(&lookup, "TIERED_CACHE_STATS_LOG_INTERVAL_SECS")? {
            builder = builder.stats_log_interval(Duration::from_secs(v));
        }

        let config = builder.build();
        config.validate()?;
        debug!("Loaded coordinator config from environment: {:?}", config);
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::ConfigError(format!("{}={:?}: {}", name, raw, e))),
    }
}

/// Builder for coordinator configuration
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    max_entries: Option<usize>,
    max_size_bytes: Option<usize>,
    promotion_timeout: Option<Duration>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
    stats_log_interval: Option<Duration>,
}

impl CoordinatorConfigBuilder {
    /// Set maximum number of fast tier entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set maximum fast tier size in bytes
    pub fn max_size_bytes(mut self, size: usize) -> Self {
        self.max_size_bytes = Some(size);
        self
    }

    /// Set the deadline for promotion writes
    pub fn promotion_timeout(mut self, timeout: Duration) -> Self {
        self.promotion_timeout = Some(timeout);
        self
    }

    /// Enable or disable the periodic expiry sweep
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Log stats snapshots periodically
    pub fn stats_log_interval(mut self, interval: Duration) -> Self {
        self.stats_log_interval = Some(interval);
        self
    }

    /// Build the coordinator configuration
    pub fn build(self) -> CoordinatorConfig {
        let defaults = CoordinatorConfig::default();

        CoordinatorConfig {
            fast: FastTierConfig {
                max_entries: self.max_entries.unwrap_or(defaults.fast.max_entries),
                max_size_bytes: self.max_size_bytes.unwrap_or(defaults.fast.max_size_bytes),
            },
            promotion_timeout: self.promotion_timeout.unwrap_or(defaults.promotion_timeout),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
            stats_log_interval: self.stats_log_interval.or(defaults.stats_log_interval),
        }
    }
}

/// Preset configurations
impl CoordinatorConfig {
    /// Memory-constrained environments
    pub fn small() -> Self {
        Self {
            fast: FastTierConfig::new(1_000, 10 * 1024 * 1024), // 10 MB
            ..Default::default()
        }
    }

    /// Large deployments
    pub fn large() -> Self {
        Self {
            fast: FastTierConfig::new(1_000_000, 8 * 1024 * 1024 * 1024),
            cleanup_interval: Duration::from_secs(60),
            stats_log_interval: Some(Duration::from_secs(60)),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.fast.max_entries, 10_000);
        assert_eq!(config.fast.max_size_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.promotion_timeout, Duration::from_secs(2));
        assert!(config.enable_auto_cleanup);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CoordinatorConfig::default();
        config.fast.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.fast.max_size_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.promotion_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.stats_log_interval = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = CoordinatorConfig::builder()
            .max_entries(500)
            .max_size_bytes(4096)
            .promotion_timeout(Duration::from_millis(250))
            .enable_auto_cleanup(false)
            .build();

        assert_eq!(config.fast, FastTierConfig::new(500, 4096));
        assert_eq!(config.promotion_timeout, Duration::from_millis(250));
        assert!(!config.enable_auto_cleanup);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("TIERED_CACHE_FAST_MAX_ENTRIES", "42"),
            ("TIERED_CACHE_PROMOTION_TIMEOUT_MS", "750"),
            ("TIERED_CACHE_SWEEP_INTERVAL_SECS", "0"),
            ("TIERED_CACHE_STATS_LOG_INTERVAL_SECS", "30"),
        ]
        .into_iter()
        .collect();

        let config =
            CoordinatorConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.fast.max_entries, 42);
        assert_eq!(config.fast.max_size_bytes, FastTierConfig::default().max_size_bytes);
        assert_eq!(config.promotion_timeout, Duration::from_millis(750));
        assert!(!config.enable_auto_cleanup);
        assert_eq!(config.stats_log_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = CoordinatorConfig::from_lookup(|name| {
            (name == "TIERED_CACHE_FAST_MAX_ENTRIES").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(CacheError::ConfigError(_))));
    }

    #[test]
    fn test_preset_configs() {
        assert_eq!(CoordinatorConfig::small().fast.max_entries, 1_000);
        assert_eq!(CoordinatorConfig::large().fast.max_entries, 1_000_000);
        assert!(CoordinatorConfig::large().validate().is_ok());
    }
}

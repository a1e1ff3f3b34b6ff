//! Cache keys
//!
//! A [`CacheKey`] is the strategy namespace plus a caller-supplied subkey. The
//! coordinator never normalizes subkeys; [`CacheKeyBuilder`] and
//! [`normalize_subkey`] are helpers for callers that need to.

use crate::strategy::CacheStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite key: `strategy:subkey`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    strategy: CacheStrategy,
    subkey: String,
    full: String,
}

impl CacheKey {
    pub fn new(strategy: CacheStrategy, subkey: impl Into<String>) -> Self {
        let subkey = subkey.into();
        let full = format!("{}:{}", strategy.as_str(), subkey);
        Self {
            strategy,
            subkey,
            full,
        }
    }

    pub fn strategy(&self) -> &CacheStrategy {
        &self.strategy
    }

    pub fn subkey(&self) -> &str {
        &self.subkey
    }

    /// The namespaced string stored in every tier
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Whether this key falls under a `delete_prefix` prefix
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.full.starts_with(prefix)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

/// Trim, collapse inner whitespace and lowercase a free-text subkey
pub fn normalize_subkey(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Builds subkeys from a base identifier and parameters
///
/// Parameters are sorted by name so the same logical request always maps to
/// the same key: `base|lang:ko|size:3`.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    strategy: CacheStrategy,
    identifier: String,
    params: Vec<(String, String)>,
}

impl CacheKeyBuilder {
    /// Create a new cache key builder
    pub fn new(strategy: CacheStrategy) -> Self {
        Self {
            strategy,
            identifier: String::new(),
            params: Vec::new(),
        }
    }

    /// Set the primary identifier
    pub fn identifier(mut self, id: impl Into<String>) -> Self {
        self.identifier = id.into();
        self
    }

    /// Set the primary identifier after normalizing it
    pub fn normalized_identifier(mut self, id: &str) -> Self {
        self.identifier = normalize_subkey(id);
        self
    }

    /// Add a parameter to the key
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Build the subkey only
    pub fn build_subkey(mut self) -> String {
        if self.params.is_empty() {
            return self.identifier;
        }

        self.params.sort();
        let params_str: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();

        format!("{}|{}", self.identifier, params_str.join("|"))
    }

    /// Build the full cache key
    pub fn build(self) -> CacheKey {
        let strategy = self.strategy.clone();
        CacheKey::new(strategy, self.build_subkey())
    }
}

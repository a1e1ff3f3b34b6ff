//! Integration points for the generation services
//!
//! [`GuideCache`] gives each expensive producer (autocomplete, guide text,
//! multi-source data integration, coordinate lookup, chapter scripts) a typed
//! accessor that builds a normalized key and reads through the coordinator.

use crate::coordinator::CacheCoordinator;
use crate::error::Result;
use crate::key::CacheKeyBuilder;
use crate::stats::StatsSnapshot;
use crate::strategy::CacheStrategy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Geocoded position of a place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,

    /// Which lookup produced the position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// One narrated chapter of a guide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub index: usize,
    pub title: String,
    pub script: String,
}

/// Typed cache for guide generation workloads
#[derive(Clone)]
pub struct GuideCache {
    coordinator: Arc<CacheCoordinator>,
}

impl GuideCache {
    pub fn new(coordinator: Arc<CacheCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Autocomplete suggestions for a partial query
    pub async fn autocomplete<F, Fut>(
        &self,
        query: &str,
        language: &str,
        generator: F,
    ) -> Result<Vec<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<String>>>,
    {
        let subkey = Self::autocomplete_subkey(query, language);
        self.coordinator
            .get_json(&CacheStrategy::SearchAutocomplete, &subkey, generator)
            .await
    }

    /// Generated guide content for a location
    pub async fn guide<T, F, Fut>(&self, location: &str, language: &str, generator: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let subkey = Self::guide_subkey(location, language);
        self.coordinator
            .get_json(&CacheStrategy::GuideGeneration, &subkey, generator)
            .await
    }

    /// Data merged from several upstream sources
    ///
    /// The source list is part of the key; its order does not matter.
    pub async fn data_integration<T, F, Fut>(
        &self,
        location: &str,
        sources: &[&str],
        generator: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut sources = sources.to_vec();
        sources.sort_unstable();
        sources.dedup();

        let subkey = CacheKeyBuilder::new(CacheStrategy::DataIntegration)
            .normalized_identifier(location)
            .param("sources", sources.join(","))
            .build_subkey();

        self.coordinator
            .get_json(&CacheStrategy::DataIntegration, &subkey, generator)
            .await
    }

    /// Coordinates for a place name
    pub async fn coordinates<F, Fut>(&self, place: &str, generator: F) -> Result<Coordinates>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Coordinates>>,
    {
        let subkey = CacheKeyBuilder::new(CacheStrategy::CoordinateEnhancement)
            .normalized_identifier(place)
            .build_subkey();

        self.coordinator
            .get_json(&CacheStrategy::CoordinateEnhancement, &subkey, generator)
            .await
    }

    /// Chapter scripts of a guide
    pub async fn chapters<F, Fut>(
        &self,
        location: &str,
        language: &str,
        generator: F,
    ) -> Result<Vec<Chapter>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<Chapter>>>,
    {
        let subkey = Self::guide_subkey(location, language);
        self.coordinator
            .get_json(&CacheStrategy::ChapterGeneration, &subkey, generator)
            .await
    }

    /// Drop a cached guide and its chapters, e.g. after the content was edited
    pub async fn invalidate_guide(&self, location: &str, language: &str) -> Result<()> {
        let subkey = Self::guide_subkey(location, language);
        self.coordinator
            .invalidate(&CacheStrategy::GuideGeneration, &subkey)
            .await?;
        self.coordinator
            .invalidate(&CacheStrategy::ChapterGeneration, &subkey)
            .await
    }

    /// Get cache statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.coordinator.stats()
    }

    /// Clear the entire cache
    pub async fn clear(&self) -> Result<usize> {
        self.coordinator.cleanup(None).await
    }

    fn autocomplete_subkey(query: &str, language: &str) -> String {
        CacheKeyBuilder::new(CacheStrategy::SearchAutocomplete)
            .normalized_identifier(query)
            .param("lang", language.to_lowercase())
            .build_subkey()
    }

    fn guide_subkey(location: &str, language: &str) -> String {
        CacheKeyBuilder::new(CacheStrategy::GuideGeneration)
            .normalized_identifier(location)
            .param("lang", language.to_lowercase())
            .build_subkey()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::{DurableTier, RemoteTier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn guide_cache(tmp: &TempDir) -> GuideCache {
        let durable = DurableTier::open(tmp.path()).await.unwrap();
        let coordinator = CacheCoordinator::builder()
            .remote_tier(Arc::new(RemoteTier::new()))
            .durable_tier(Arc::new(durable))
            .build()
            .unwrap();
        GuideCache::new(Arc::new(coordinator))
    }

    #[test]
    fn test_subkeys_are_normalized() {
        assert_eq!(
            GuideCache::autocomplete_subkey("  Gyeongbok   Palace ", "KO"),
            "gyeongbok palace|lang:ko"
        );
        assert_eq!(
            GuideCache::guide_subkey("Namsan Tower", "en"),
            GuideCache::guide_subkey("namsan  tower", "EN")
        );
    }

    #[tokio::test]
    async fn test_autocomplete_reads_through() {
        let tmp = TempDir::new().unwrap();
        let cache = guide_cache(&tmp).await;
        let calls = AtomicUsize::new(0);

        for query in ["경복궁", " 경복궁 "] {
            let suggestions = cache
                .autocomplete(query, "ko", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["경복궁".to_string(), "남산타워".to_string()])
                })
                .await
                .unwrap();
            assert_eq!(suggestions, vec!["경복궁", "남산타워"]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits_by_tier.fast, 1);
    }

    #[tokio::test]
    async fn test_data_integration_source_order_is_irrelevant() {
        let tmp = TempDir::new().unwrap();
        let cache = guide_cache(&tmp).await;

        let first: Vec<String> = cache
            .data_integration("Seoul", &["wikipedia", "places"], || async {
                Ok(vec!["merged".to_string()])
            })
            .await
            .unwrap();

        let second: Vec<String> = cache
            .data_integration("seoul", &["places", "wikipedia", "places"], || async {
                Err(anyhow::anyhow!("should have been cached"))
            })
            .await
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_coordinates_and_chapters() {
        let tmp = TempDir::new().unwrap();
        let cache = guide_cache(&tmp).await;

        let coords = cache
            .coordinates("N Seoul Tower", || async {
                Ok(Coordinates::new(37.5512, 126.9882).with_source("places"))
            })
            .await
            .unwrap();
        assert_eq!(coords.source.as_deref(), Some("places"));

        let chapters = cache
            .chapters("N Seoul Tower", "en", || async {
                Ok(vec![Chapter {
                    index: 0,
                    title: "Arrival".to_string(),
                    script: "Welcome to Namsan.".to_string(),
                }])
            })
            .await
            .unwrap();
        assert_eq!(chapters.len(), 1);

        cache.invalidate_guide("N Seoul Tower", "en").await.unwrap();
        let regenerated = cache
            .chapters("N Seoul Tower", "en", || async { Ok(Vec::new()) })
            .await
            .unwrap();
        assert!(regenerated.is_empty());
    }

    #[tokio::test]
    async fn test_guide_failure_is_not_cached() {
        let tmp = TempDir::new().unwrap();
        let cache = guide_cache(&tmp).await;

        let failed: Result<String> = cache
            .guide("Busan", "ko", || async { Err(anyhow::anyhow!("model overloaded")) })
            .await;
        assert!(failed.unwrap_err().is_generator_failure());

        let guide: String = cache
            .guide("Busan", "ko", || async { Ok("해운대 가이드".to_string()) })
            .await
            .unwrap();
        assert_eq!(guide, "해운대 가이드");
        assert_eq!(cache.stats().generator_failures, 1);
    }
}

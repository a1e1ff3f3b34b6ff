//! Durable tier adapter backed by a directory of entry files
//!
//! Each key lives in `<sha256(key)>.entry`:
//!
//! ```text
//! ---
//! key: guide_generation:seoul
//! created_at: ...
//! expires_at: ...
//! size_bytes: 1234
//! ---
//! <raw value bytes>
//! ```
//!
//! Writes go to a temporary file first and are renamed into place, so a
//! reader never sees a half-written entry. Renames and stale-file removals
//! for the same file are serialized, so removing an expired entry can never
//! take a fresh one written in between. Temporary files left behind by a
//! crash are collected by `purge_expired` and `delete_prefix("")` once they
//! are older than [`STALE_TEMP_AGE`].

use crate::entry::{expiry_from_now, StoredValue};
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::strategy::TierKind;
use crate::tier::TierStore;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const ENTRY_EXTENSION: &str = "entry";
const TEMP_EXTENSION_PREFIX: &str = "tmp-";
const DELIMITER: &str = "---\n";
const LOCK_STRIPES: usize = 16;

/// A temporary file this old belongs to a write that will never finish
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryHeader {
    key: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    size_bytes: usize,
}

/// File-per-key durable store
pub struct DurableTier {
    base_dir: PathBuf,
    write_seq: AtomicU64,

    /// Serializes renames and stale removals, striped by file name
    locks: Vec<Mutex<()>>,
}

impl DurableTier {
    /// Open (and create if needed) a durable tier rooted at `base_dir`
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| CacheError::tier(TierKind::Durable, format!("{}: {}", base_dir.display(), e)))?;

        info!("Durable tier opened at {}", base_dir.display());
        Ok(Self {
            base_dir,
            write_seq: AtomicU64::new(0),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.base_dir
            .join(format!("{}.{}", hex::encode(digest), ENTRY_EXTENSION))
    }

    /// Lock stripe for an entry file, chosen by the first digest character
    fn lock_for(&self, path: &Path) -> &Mutex<()> {
        let stripe = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.chars().next())
            .and_then(|c| c.to_digit(16))
            .unwrap_or(0) as usize;
        &self.locks[stripe % self.locks.len()]
    }

    fn serialize_entry(&self, header: &EntryHeader, value: &[u8]) -> Result<Vec<u8>> {
        let frontmatter = serde_yaml::to_string(header)?;

        let mut out = Vec::with_capacity(frontmatter.len() + value.len() + 2 * DELIMITER.len());
        out.extend_from_slice(DELIMITER.as_bytes());
        out.extend_from_slice(frontmatter.as_bytes());
        out.extend_from_slice(DELIMITER.as_bytes());
        out.extend_from_slice(value);
        Ok(out)
    }

    fn parse_entry(content: &[u8]) -> Option<(EntryHeader, Bytes)> {
        let rest = content.strip_prefix(DELIMITER.as_bytes())?;
        let closing = b"\n---\n";
        let end = rest.windows(closing.len()).position(|w| w == closing)?;

        let header_text = std::str::from_utf8(&rest[..=end]).ok()?;
        let header: EntryHeader = serde_yaml::from_str(header_text).ok()?;
        let body = &rest[end + closing.len()..];

        if body.len() != header.size_bytes {
            return None;
        }
        Some((header, Bytes::copy_from_slice(body)))
    }

    /// Read only the frontmatter of an entry file
    async fn read_header(path: &Path) -> Option<EntryHeader> {
        let file = fs::File::open(path).await.ok()?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();

        reader.read_line(&mut line).await.ok()?;
        if line != DELIMITER {
            return None;
        }

        let mut header_text = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await.ok()?;
            if read == 0 {
                return None;
            }
            if line == DELIMITER {
                break;
            }
            header_text.push_str(&line);
        }

        serde_yaml::from_str(&header_text).ok()
    }

    async fn remove_file(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::tier(TierKind::Durable, e)),
        }
    }

    /// Remove `path` if, re-read under its lock, it is unreadable or its
    /// header still satisfies `predicate`
    ///
    /// A concurrent `set` that renamed a fresh entry into place wins.
    async fn remove_if<F>(&self, path: &Path, predicate: &F) -> Result<bool>
    where
        F: Fn(&EntryHeader) -> bool + Sync,
    {
        let _guard = self.lock_for(path).lock().await;

        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CacheError::tier(TierKind::Durable, e)),
        };

        let stale = match Self::parse_entry(&content) {
            Some((header, _)) => predicate(&header),
            None => true,
        };
        if !stale {
            debug!("Keeping {} replaced by a concurrent write", path.display());
            return Ok(false);
        }
        self.remove_file(path).await
    }

    fn is_temp_file(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.starts_with(TEMP_EXTENSION_PREFIX))
    }

    /// Remove a temporary file left by a write that never renamed it
    async fn remove_stale_temp(&self, path: &Path) -> Result<bool> {
        let modified = match fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CacheError::tier(TierKind::Durable, e)),
        };

        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age < STALE_TEMP_AGE {
            return Ok(false);
        }

        warn!("Removing abandoned durable temp file {}", path.display());
        self.remove_file(path).await
    }

    /// Internal: remove entry files whose header satisfies `predicate`, and
    /// abandoned temporary files when `collect_temps` is set
    async fn remove_matching<F>(&self, predicate: F, collect_temps: bool) -> Result<usize>
    where
        F: Fn(&EntryHeader) -> bool + Send + Sync,
    {
        let mut dir = fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| CacheError::tier(TierKind::Durable, e))?;

        let mut removed = 0;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| CacheError::tier(TierKind::Durable, e))?
        {
            let path = item.path();
            if Self::is_temp_file(&path) {
                if collect_temps {
                    self.remove_stale_temp(&path).await?;
                }
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }

            let matches = match Self::read_header(&path).await {
                Some(header) => predicate(&header),
                // Unreadable entries are garbage either way
                None => true,
            };

            if matches && self.remove_if(&path, &predicate).await? {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl TierStore for DurableTier {
    fn kind(&self) -> TierKind {
        TierKind::Durable
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredValue>> {
        let path = self.entry_path(key.as_str());

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::tier(TierKind::Durable, e)),
        };

        let Some((header, value)) = Self::parse_entry(&content) else {
            warn!("Discarding corrupt durable entry for {}", key);
            self.remove_if(&path, &|header: &EntryHeader| Utc::now() > header.expires_at)
                .await?;
            return Ok(None);
        };

        if header.key != key.as_str() {
            // Digest collision; not our entry
            return Ok(None);
        }

        if Utc::now() > header.expires_at {
            debug!("Durable tier entry expired: {}", key);
            self.remove_if(&path, &|header: &EntryHeader| Utc::now() > header.expires_at)
                .await?;
            return Ok(None);
        }

        Ok(Some(StoredValue::new(value, header.expires_at)))
    }

    async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<()> {
        let header = EntryHeader {
            key: key.as_str().to_string(),
            created_at: Utc::now(),
            expires_at: expiry_from_now(ttl),
            size_bytes: value.len(),
        };
        let content = self.serialize_entry(&header, &value)?;

        let path = self.entry_path(key.as_str());
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("tmp-{}-{}", std::process::id(), seq));

        fs::write(&tmp_path, &content)
            .await
            .map_err(|e| CacheError::tier(TierKind::Durable, e))?;

        let renamed = {
            let _guard = self.lock_for(&path).lock().await;
            fs::rename(&tmp_path, &path).await
        };
        if let Err(e) = renamed {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CacheError::tier(TierKind::Durable, e));
        }

        debug!("Durable tier stored {} ({} bytes)", key, header.size_bytes);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.remove_file(&self.entry_path(key.as_str())).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let removed = self
            .remove_matching(|header| header.key.starts_with(prefix), prefix.is_empty())
            .await?;
        info!("Removed {} durable entries", removed);
        Ok(removed)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        self.remove_matching(|header| now > header.expires_at, true)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::CacheStrategy;
    use tempfile::TempDir;

    fn key(subkey: &str) -> CacheKey {
        CacheKey::new(CacheStrategy::GuideGeneration, subkey)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let tmp = TempDir::new().unwrap();
        let tier = DurableTier::open(tmp.path()).await.unwrap();

        let value = Bytes::from("경복궁 가이드\n---\nwith a delimiter inside");
        tier.set(&key("seoul"), value.clone(), Duration::from_secs(60)).await.unwrap();

        let stored = tier.get(&key("seoul")).await.unwrap().unwrap();
        assert_eq!(stored.value, value);
        assert!(stored.remaining_ttl().is_some());

        assert!(tier.get(&key("busan")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let tier = DurableTier::open(tmp.path()).await.unwrap();
            tier.set(&key("seoul"), Bytes::from_static(b"guide"), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let tier = DurableTier::open(tmp.path()).await.unwrap();
        let stored = tier.get(&key("seoul")).await.unwrap().unwrap();
        assert_eq!(stored.value, Bytes::from_static(b"guide"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_and_removed() {
        let tmp = TempDir::new().unwrap();
        let tier = DurableTier::open(tmp.path()).await.unwrap();

        tier.set(&key("old"), Bytes::from_static(b"x"), Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(tier.get(&key("old")).await.unwrap().is_none());
        assert!(!tier.entry_path(key("old").as_str()).exists());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let tier = DurableTier::open(tmp.path()).await.unwrap();

        let path = tier.entry_path(key("broken").as_str());
        std::fs::write(&path, b"not an entry").unwrap();

        assert!(tier.get(&key("broken")).await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_delete_and_delete_prefix() {
        let tmp = TempDir::new().unwrap();
        let tier = DurableTier::open(tmp.path()).await.unwrap();
        let coords = CacheKey::new(CacheStrategy::CoordinateEnhancement, "namsan");

        tier.set(&key("a"), Bytes::from_static(b"1"), Duration::from_secs(60)).await.unwrap();
        tier.set(&key("b"), Bytes::from_static(b"2"), Duration::from_secs(60)).await.unwrap();
        tier.set(&coords, Bytes::from_static(b"3"), Duration::from_secs(60)).await.unwrap();

        tier.delete(&key("a")).await.unwrap();
        tier.delete(&key("a")).await.unwrap();
        assert!(tier.get(&key("a")).await.unwrap().is_none());

        let removed = tier
            .delete_prefix(&CacheStrategy::GuideGeneration.key_prefix())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(tier.get(&coords).await.unwrap().is_some());

        assert_eq!(tier.delete_prefix("").await.unwrap(), 1);
        assert!(tier.get(&coords).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let tmp = TempDir::new().unwrap();
        let tier = DurableTier::open(tmp.path()).await.unwrap();

        tier.set(&key("short"), Bytes::from_static(b"1"), Duration::from_millis(10)).await.unwrap();
        tier.set(&key("long"), Bytes::from_static(b"2"), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(tier.purge_expired().await.unwrap(), 1);
        assert!(tier.get(&key("long")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_removal_keeps_a_fresh_replacement() {
        let tmp = TempDir::new().unwrap();
        let tier = DurableTier::open(tmp.path()).await.unwrap();
        let k = key("contended");
        let path = tier.entry_path(k.as_str());

        tier.set(&k, Bytes::from_static(b"old"), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // A reader saw the expired file; a writer replaces it before the removal runs
        tier.set(&k, Bytes::from_static(b"new"), Duration::from_secs(60)).await.unwrap();
        let removed = tier
            .remove_if(&path, &|header: &EntryHeader| Utc::now() > header.expires_at)
            .await
            .unwrap();

        assert!(!removed);
        let stored = tier.get(&k).await.unwrap().unwrap();
        assert_eq!(stored.value, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_expired_reads_never_drop_fresh_writes() {
        let tmp = TempDir::new().unwrap();
        let tier = std::sync::Arc::new(DurableTier::open(tmp.path()).await.unwrap());
        let k = key("busy");

        tier.set(&k, Bytes::from_static(b"old"), Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let tier = tier.clone();
                let k = k.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        tier.get(&k).await.unwrap();
                    }
                })
            })
            .collect();
        tier.set(&k, Bytes::from_static(b"fresh"), Duration::from_secs(60)).await.unwrap();

        for reader in readers {
            reader.await.unwrap();
        }
        let stored = tier.get(&k).await.unwrap().unwrap();
        assert_eq!(stored.value, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn test_abandoned_temp_files_are_collected() {
        let tmp = TempDir::new().unwrap();
        let tier = DurableTier::open(tmp.path()).await.unwrap();
        let entry = tier.entry_path(key("crashed").as_str());

        let abandon = |name: &str| {
            let path = entry.with_extension(name);
            std::fs::write(&path, b"---\npartial").unwrap();
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(SystemTime::now() - STALE_TEMP_AGE - Duration::from_secs(60))
                .unwrap();
            path
        };

        let old = abandon("tmp-999-0");
        let in_progress = entry.with_extension("tmp-999-1");
        std::fs::write(&in_progress, b"---\n").unwrap();

        // Temp files are not entries, so they are not counted
        assert_eq!(tier.purge_expired().await.unwrap(), 0);
        assert!(!old.exists());
        assert!(in_progress.exists());

        let old = abandon("tmp-999-2");
        tier.delete_prefix(&CacheStrategy::GuideGeneration.key_prefix())
            .await
            .unwrap();
        assert!(old.exists());

        tier.delete_prefix("").await.unwrap();
        assert!(!old.exists());
        assert!(in_progress.exists());
    }
}

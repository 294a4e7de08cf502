//! Durable tier: one JSON file per cache key.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;

use super::tier::{CacheEntry, CacheTier};

pub struct DiskTier {
    dir: PathBuf,
}

impl DiskTier {
    pub async fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating cache directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    async fn entry_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

async fn remove_if_present(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CacheTier for DiskTier {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn load(&self, key: &str) -> anyhow::Result<Option<CacheEntry>> {
        let bytes = match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry = serde_json::from_slice(&bytes)
            .with_context(|| format!("decoding cache file for {key}"))?;
        Ok(Some(entry))
    }

    async fn store(&self, entry: &CacheEntry, _ttl: Duration) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        let path = self.path(&entry.key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        remove_if_present(&self.path(key)).await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        for path in self.entry_files().await? {
            remove_if_present(&path).await?;
        }
        Ok(())
    }

    async fn purge_expired(&self, ttl: Duration) -> anyhow::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for path in self.entry_files().await? {
            let modified = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.modified()?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age >= ttl {
                remove_if_present(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.entry_files().await?.len())
    }

    async fn preload(&self, ttl: Duration) -> anyhow::Result<Vec<CacheEntry>> {
        let now = Utc::now();
        let mut entries = Vec::new();
        for path in self.entry_files().await? {
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<CacheEntry>(&bytes)?));
            match parsed {
                Ok(entry) if !entry.is_expired(ttl, now) => entries.push(entry),
                Ok(_) => remove_if_present(&path).await?,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable cache file");
                    remove_if_present(&path).await?;
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GenerationResponse, ProviderId};
    use chrono::TimeDelta;
    use std::collections::BTreeMap;

    fn entry(key: &str) -> CacheEntry {
        CacheEntry::new(
            key.to_string(),
            GenerationResponse {
                images: vec![vec![1, 2, 3]],
                image_urls: vec![],
                cost: 0.04,
                generation_time: Duration::from_millis(800),
                provider: ProviderId::from("p"),
                metadata: BTreeMap::new(),
            },
            ProviderId::from("p"),
        )
    }

    #[tokio::test]
    async fn test_store_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path()).await.unwrap();

        let original = entry("abc");
        tier.store(&original, Duration::from_secs(60)).await.unwrap();
        assert!(dir.path().join("abc.json").exists());
        assert_eq!(tier.load("abc").await.unwrap(), Some(original));
        assert_eq!(tier.count().await.unwrap(), 1);

        tier.remove("abc").await.unwrap();
        tier.remove("abc").await.unwrap();
        assert_eq!(tier.load("abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_uses_file_age() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path()).await.unwrap();
        tier.store(&entry("a"), Duration::from_secs(60)).await.unwrap();
        tier.store(&entry("b"), Duration::from_secs(60)).await.unwrap();

        assert_eq!(tier.purge_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(tier.purge_expired(Duration::ZERO).await.unwrap(), 2);
        assert_eq!(tier.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_preload_skips_expired_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path()).await.unwrap();

        tier.store(&entry("fresh"), Duration::from_secs(60)).await.unwrap();
        let mut stale = entry("stale");
        stale.created_at = Utc::now() - TimeDelta::days(2);
        tier.store(&stale, Duration::from_secs(60)).await.unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"{not json")
            .await
            .unwrap();

        let loaded = tier.preload(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, "fresh");
        assert_eq!(tier.count().await.unwrap(), 1);
    }
}

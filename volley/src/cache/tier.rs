use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{GenerationResponse, ProviderId};

/// One cached response plus access bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: GenerationResponse,
    pub created_at: DateTime<Utc>,
    pub provider: ProviderId,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: String, response: GenerationResponse, provider: ProviderId) -> Self {
        let now = Utc::now();
        Self {
            key,
            response,
            created_at: now,
            provider,
            access_count: 0,
            last_accessed: now,
        }
    }

    /// Age at `now` has reached `ttl`. Entries from the future never expire.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        (now - self.created_at)
            .to_std()
            .is_ok_and(|age| age >= ttl)
    }

    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }
}

/// A storage backend behind the memory tier.
///
/// Errors are reported to the cache, which logs and counts them; they never
/// reach a caller of [`ResponseCache`](super::ResponseCache).
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load(&self, key: &str) -> anyhow::Result<Option<CacheEntry>>;

    async fn store(&self, entry: &CacheEntry, ttl: Duration) -> anyhow::Result<()>;

    async fn remove(&self, key: &str) -> anyhow::Result<()>;

    async fn clear(&self) -> anyhow::Result<()>;

    /// Delete entries older than `ttl`, returning how many were removed.
    async fn purge_expired(&self, ttl: Duration) -> anyhow::Result<usize>;

    async fn count(&self) -> anyhow::Result<usize>;

    /// Unexpired entries to load into memory at startup.
    async fn preload(&self, _ttl: Duration) -> anyhow::Result<Vec<CacheEntry>> {
        Ok(Vec::new())
    }
}

//! Multi-tier response cache.
//!
//! Lookups go memory first, then every configured tier in order
//! (distributed, then durable); a lower-tier hit is promoted back into
//! memory. Writes land in memory synchronously and are mirrored to the other
//! tiers in the background. Tier failures are logged and counted, never
//! returned: a broken tier only costs cache hits.

pub mod disk;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod tier;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::CacheConfig;
use crate::types::{GenerationRequest, GenerationResponse, ProviderId};

pub use disk::DiskTier;
pub use memory::MemoryTier;
pub use tier::{CacheEntry, CacheTier};

/// Request fields that never influence generated output.
const IGNORED_FIELDS: &[&str] = &["webhook_url", "callback_url", "request_id"];

/// Cache key for a request served by `provider`.
///
/// SHA-256 over canonical JSON: object keys sorted at every level, with
/// notification and correlation fields removed and the provider id added.
pub fn cache_key(request: &GenerationRequest, provider: &ProviderId) -> String {
    let mut value = serde_json::to_value(request).unwrap_or_default();
    if let Value::Object(map) = &mut value {
        for field in IGNORED_FIELDS {
            map.remove(*field);
        }
        if let Some(Value::Object(extra)) = map.get_mut("extra_params") {
            for field in IGNORED_FIELDS {
                extra.remove(*field);
            }
        }
        map.insert("provider_id".to_string(), Value::String(provider.to_string()));
    }

    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn error(&self, tier: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("volley_cache_errors_total", "tier" => tier).increment(1);
    }

    fn reset(&self) {
        for counter in [&self.hits, &self.misses, &self.writes, &self.evictions, &self.errors] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub memory_entries: usize,
    pub max_memory_entries: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCacheInfo {
    pub entries: usize,
    /// Sum of the original generation cost of the cached responses
    pub cached_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierInfo {
    pub name: String,
    /// `None` when the tier could not be counted
    pub entries: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInfo {
    pub stats: CacheStats,
    pub providers: BTreeMap<ProviderId, ProviderCacheInfo>,
    pub tiers: Vec<TierInfo>,
}

/// Tiered cache of generation responses keyed by [`cache_key`].
pub struct ResponseCache {
    memory: MemoryTier,
    tiers: Vec<Arc<dyn CacheTier>>,
    ttl: Duration,
    tier_timeout: Duration,
    counters: Arc<Counters>,
    mirror_tasks: TaskTracker,
}

impl ResponseCache {
    /// Memory-only cache. Add lower tiers with [`with_tier`](Self::with_tier).
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            memory: MemoryTier::new(config.max_memory_entries, config.eviction_batch),
            tiers: Vec::new(),
            ttl: config.ttl,
            tier_timeout: config.tier_timeout,
            counters: Arc::new(Counters::default()),
            mirror_tasks: TaskTracker::new(),
        }
    }

    pub fn with_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Build the cache with the tiers named in `config`: distributed first, then durable.
    pub async fn from_config(config: &CacheConfig) -> anyhow::Result<Self> {
        let mut cache = Self::new(config);

        if let Some(redis_config) = &config.redis {
            #[cfg(feature = "redis")]
            {
                let tier = self::redis::RedisTier::new(&redis_config.url, redis_config.key_prefix.clone())?;
                cache = cache.with_tier(Arc::new(tier));
                tracing::info!("Redis cache tier enabled");
            }
            #[cfg(not(feature = "redis"))]
            tracing::warn!(
                url = %redis_config.url,
                "Redis cache tier configured but this build lacks the `redis` feature; skipping"
            );
        }

        if let Some(disk) = &config.disk {
            let tier = DiskTier::new(&disk.dir).await?;
            tracing::info!(dir = %disk.dir.display(), "Disk cache tier enabled");
            cache = cache.with_tier(Arc::new(tier));
        }

        Ok(cache)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached response for `request` on `provider`, if present and fresh.
    pub async fn get(
        &self,
        request: &GenerationRequest,
        provider: &ProviderId,
    ) -> Option<GenerationResponse> {
        let key = cache_key(request, provider);
        self.get_entry(&key).await.map(|entry| entry.response)
    }

    /// Lookup by key across all tiers, purging expired copies on the way.
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();

        if let Some(entry) = self.memory.get(key) {
            if !entry.is_expired(self.ttl, now) {
                self.record_hit();
                return Some(entry);
            }
            self.memory.remove(key);
            tracing::debug!(key, "Purged expired entry from memory");
        }

        for tier in &self.tiers {
            match tokio::time::timeout(self.tier_timeout, tier.load(key)).await {
                Ok(Ok(Some(entry))) if entry.is_expired(self.ttl, now) => {
                    tracing::debug!(key, tier = tier.name(), "Purging expired entry");
                    self.tier_call(tier.as_ref(), "remove", tier.remove(key)).await;
                }
                Ok(Ok(Some(mut entry))) => {
                    entry.touch();
                    self.insert_memory(entry.clone());
                    tracing::debug!(key, tier = tier.name(), "Promoted cache hit to memory");
                    self.record_hit();
                    return Some(entry);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(key, tier = tier.name(), error = %e, "Cache tier load failed");
                    self.counters.error(tier.name());
                }
                Err(_) => {
                    tracing::warn!(key, tier = tier.name(), "Cache tier load timed out");
                    self.counters.error(tier.name());
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("volley_cache_misses_total").increment(1);
        None
    }

    /// Store `response`. Memory is written immediately; other tiers in the background.
    pub async fn set(
        &self,
        request: &GenerationRequest,
        provider: &ProviderId,
        response: &GenerationResponse,
    ) {
        let key = cache_key(request, provider);
        let entry = CacheEntry::new(key, response.clone(), provider.clone());
        self.insert_memory(entry.clone());
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        for tier in &self.tiers {
            let tier = tier.clone();
            let entry = entry.clone();
            let counters = self.counters.clone();
            let ttl = self.ttl;
            let timeout = self.tier_timeout;
            self.mirror_tasks.spawn(async move {
                match tokio::time::timeout(timeout, tier.store(&entry, ttl)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(key = %entry.key, tier = tier.name(), error = %e, "Cache tier write failed");
                        counters.error(tier.name());
                    }
                    Err(_) => {
                        tracing::warn!(key = %entry.key, tier = tier.name(), "Cache tier write timed out");
                        counters.error(tier.name());
                    }
                }
            });
        }
    }

    /// Remove one request's entry from every tier.
    pub async fn invalidate(&self, request: &GenerationRequest, provider: &ProviderId) {
        self.invalidate_key(&cache_key(request, provider)).await;
    }

    pub async fn invalidate_key(&self, key: &str) {
        self.memory.remove(key);
        for tier in &self.tiers {
            self.tier_call(tier.as_ref(), "remove", tier.remove(key)).await;
        }
    }

    /// Empty every tier and reset counters.
    pub async fn clear(&self) {
        self.flush().await;
        self.memory.clear();
        for tier in &self.tiers {
            self.tier_call(tier.as_ref(), "clear", tier.clear()).await;
        }
        self.counters.reset();
        tracing::info!("Cache cleared");
    }

    /// Purge expired entries from every tier, returning how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut removed = self.memory.purge_expired(self.ttl);
        for tier in &self.tiers {
            if let Some(n) = self
                .tier_call(tier.as_ref(), "purge", tier.purge_expired(self.ttl))
                .await
            {
                removed += n;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Load unexpired entries from lower tiers into memory.
    pub async fn warm(&self) -> usize {
        let mut loaded = 0;
        for tier in &self.tiers {
            if let Some(entries) = self
                .tier_call(tier.as_ref(), "preload", tier.preload(self.ttl))
                .await
            {
                for entry in entries {
                    self.insert_memory(entry);
                    loaded += 1;
                }
            }
        }
        if loaded > 0 {
            tracing::info!(loaded, "Warmed memory cache");
        }
        loaded
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let cache = self.clone();
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep().await;
                    }
                }
            }
            tracing::debug!("Cache sweeper stopped");
        });
    }

    /// Wait for background tier writes to finish.
    pub async fn flush(&self) {
        self.mirror_tasks.close();
        self.mirror_tasks.wait().await;
        self.mirror_tasks.reopen();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            writes: self.counters.writes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            memory_entries: self.memory.len(),
            max_memory_entries: self.memory.max_entries(),
        }
    }

    /// Stats plus per-provider totals of the memory tier and per-tier entry counts.
    pub async fn info(&self) -> CacheInfo {
        let mut providers: BTreeMap<ProviderId, ProviderCacheInfo> = BTreeMap::new();
        for entry in self.memory.snapshot() {
            let info = providers.entry(entry.provider.clone()).or_default();
            info.entries += 1;
            info.cached_cost += entry.response.cost;
        }

        let mut tiers = vec![TierInfo {
            name: "memory".to_string(),
            entries: Some(self.memory.len()),
        }];
        for tier in &self.tiers {
            tiers.push(TierInfo {
                name: tier.name().to_string(),
                entries: self.tier_call(tier.as_ref(), "count", tier.count()).await,
            });
        }

        CacheInfo {
            stats: self.stats(),
            providers,
            tiers,
        }
    }

    fn insert_memory(&self, entry: CacheEntry) {
        let evicted = self.memory.insert(entry);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::counter!("volley_cache_evictions_total").increment(evicted as u64);
        }
    }

    fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("volley_cache_hits_total").increment(1);
    }

    /// Await a tier operation under the tier timeout; failures are logged and counted.
    async fn tier_call<T>(
        &self,
        tier: &dyn CacheTier,
        op: &'static str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.tier_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::warn!(tier = tier.name(), op, error = %e, "Cache tier operation failed");
                self.counters.error(tier.name());
                None
            }
            Err(_) => {
                tracing::warn!(tier = tier.name(), op, "Cache tier operation timed out");
                self.counters.error(tier.name());
                None
            }
        }
    }
}

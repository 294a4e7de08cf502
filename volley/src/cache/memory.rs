use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::tier::CacheEntry;

/// In-process tier.
///
/// Reads go straight to the concurrent map. Inserts and evictions are
/// serialized so two writers cannot both decide to evict the same victims.
pub struct MemoryTier {
    entries: DashMap<String, CacheEntry>,
    structure: Mutex<()>,
    max_entries: usize,
    eviction_batch: usize,
}

impl MemoryTier {
    pub fn new(max_entries: usize, eviction_batch: usize) -> Self {
        Self {
            entries: DashMap::new(),
            structure: Mutex::new(()),
            max_entries,
            eviction_batch,
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Fetch and record an access.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut entry = self.entries.get_mut(key)?;
        entry.touch();
        Some(entry.clone())
    }

    /// Insert, evicting if the ceiling is exceeded. Returns the number evicted.
    pub fn insert(&self, entry: CacheEntry) -> usize {
        let _guard = self.structure.lock();
        self.entries.insert(entry.key.clone(), entry);
        if self.entries.len() > self.max_entries {
            self.evict()
        } else {
            0
        }
    }

    /// Remove least-used entries: the excess plus a batch of up to a tenth of the ceiling.
    fn evict(&self) -> usize {
        let excess = self.entries.len().saturating_sub(self.max_entries);
        let batch = self.eviction_batch.min(self.max_entries / 10);
        let target = (excess + batch).min(self.entries.len());

        let mut candidates: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.access_count, e.last_accessed, e.key().clone()))
            .collect();
        candidates.sort();

        let mut removed = 0;
        for (_, _, key) in candidates.into_iter().take(target) {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        tracing::debug!(removed, remaining = self.entries.len(), "Evicted cache entries");
        removed
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let _guard = self.structure.lock();
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn clear(&self) {
        let _guard = self.structure.lock();
        self.entries.clear();
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let _guard = self.structure.lock();
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(ttl, now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of all entries.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GenerationResponse, ProviderId};
    use chrono::TimeDelta;
    use std::collections::BTreeMap;

    fn entry(key: &str, access_count: u64, age_secs: i64) -> CacheEntry {
        let mut entry = CacheEntry::new(
            key.to_string(),
            GenerationResponse {
                images: vec![],
                image_urls: vec![format!("https://img/{key}")],
                cost: 0.02,
                generation_time: Duration::from_secs(1),
                provider: ProviderId::from("p"),
                metadata: BTreeMap::new(),
            },
            ProviderId::from("p"),
        );
        entry.access_count = access_count;
        entry.last_accessed = Utc::now() - TimeDelta::seconds(age_secs);
        entry
    }

    #[test]
    fn test_eviction_removes_least_used_first() {
        let memory = MemoryTier::new(10, 100);
        for i in 0..10 {
            // Keys 0 and 1 are never read; older keys were accessed longer ago.
            let count = if i < 2 { 0 } else { 5 };
            memory.insert(entry(&format!("k{i}"), count, 100 - i));
        }
        assert_eq!(memory.len(), 10);

        let evicted = memory.insert(entry("k10", 0, 0));

        // One over the ceiling plus a batch of max/10 = 1.
        assert_eq!(evicted, 2);
        assert_eq!(memory.len(), 9);
        assert!(memory.get("k0").is_none());
        assert!(memory.get("k1").is_none());
        assert!(memory.get("k10").is_some());
        assert!(memory.get("k9").is_some());
    }

    #[test]
    fn test_large_ceiling_evicts_in_batches() {
        let memory = MemoryTier::new(1000, 100);
        for i in 0..1001 {
            memory.insert(entry(&format!("k{i}"), 0, 0));
        }
        assert_eq!(memory.len(), 900);
    }

    #[test]
    fn test_get_records_access() {
        let memory = MemoryTier::new(10, 1);
        memory.insert(entry("k", 0, 10));

        memory.get("k");
        let read = memory.get("k").unwrap();
        assert_eq!(read.access_count, 2);
        assert!(read.last_accessed > Utc::now() - TimeDelta::seconds(5));
    }

    #[test]
    fn test_purge_expired() {
        let memory = MemoryTier::new(10, 1);
        let mut old = entry("old", 0, 0);
        old.created_at = Utc::now() - TimeDelta::hours(25);
        memory.insert(old);
        memory.insert(entry("fresh", 0, 0));

        assert_eq!(memory.purge_expired(Duration::from_secs(24 * 3600)), 1);
        assert!(memory.get("fresh").is_some());
        assert!(memory.get("old").is_none());
    }
}

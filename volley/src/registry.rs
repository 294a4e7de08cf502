//! Registry of configured providers and the routing decisions made over it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::provider::SharedGateway;
use crate::types::ProviderId;

const RELIABILITY_WINDOW: usize = 100;

/// Upper bound on one balance query in [`ProviderManager::refresh_credits`].
pub const CREDIT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Static per-provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub requests_per_minute: u32,
    pub max_batch_size: usize,
    pub cost_per_image: f64,
    pub is_default: bool,
    pub active: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            max_batch_size: 1,
            cost_per_image: 0.02,
            is_default: false,
            active: true,
        }
    }
}

/// Rolling reliability figures for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReliabilityStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_cost: f64,
    pub consecutive_failures: u32,
    /// Success rate over the most recent attempts
    pub recent_success_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Reliability {
    stats: ReliabilityStats,
    recent: VecDeque<bool>,
}

impl Reliability {
    fn record(&mut self, success: bool, cost: f64) {
        let now = Utc::now();
        let stats = &mut self.stats;
        stats.total_requests += 1;
        if success {
            stats.successful_requests += 1;
            stats.total_cost += cost;
            stats.consecutive_failures = 0;
            stats.last_success_at = Some(now);
        } else {
            stats.failed_requests += 1;
            stats.consecutive_failures += 1;
            stats.last_failure_at = Some(now);
        }

        if self.recent.len() == RELIABILITY_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
        let successes = self.recent.iter().filter(|ok| **ok).count();
        stats.recent_success_rate = successes as f64 / self.recent.len() as f64;
    }
}

/// A configured provider with its runtime state.
///
/// Records are never removed from the registry; deactivation flips a flag.
pub struct ProviderRecord {
    id: ProviderId,
    gateway: SharedGateway,
    settings: ProviderSettings,
    active: AtomicBool,
    credits_exhausted: AtomicBool,
    rate_limited_until: Mutex<Option<Instant>>,
    limiter: RateLimiter,
    reliability: Mutex<Reliability>,
}

impl ProviderRecord {
    fn new(id: ProviderId, gateway: SharedGateway, settings: ProviderSettings) -> Self {
        Self {
            active: AtomicBool::new(settings.active),
            credits_exhausted: AtomicBool::new(false),
            rate_limited_until: Mutex::new(None),
            limiter: RateLimiter::per_minute(settings.requests_per_minute),
            reliability: Mutex::new(Reliability::default()),
            id,
            gateway,
            settings,
        }
    }

    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    pub fn gateway(&self) -> &SharedGateway {
        &self.gateway
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_credits_exhausted(&self) -> bool {
        self.credits_exhausted.load(Ordering::SeqCst)
    }

    /// The provider signalled a rate limit and the cooldown has not yet elapsed.
    ///
    /// A full local limiter does not count: it only means the next call waits.
    pub fn is_rate_limited(&self) -> bool {
        matches!(*self.rate_limited_until.lock(), Some(until) if until > Instant::now())
    }

    /// Eligible for round robin and fallback.
    pub fn is_selectable(&self) -> bool {
        self.is_active() && !self.is_credits_exhausted()
    }

    pub fn reliability(&self) -> ReliabilityStats {
        self.reliability.lock().stats.clone()
    }
}

impl std::fmt::Debug for ProviderRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRecord")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("active", &self.is_active())
            .field("credits_exhausted", &self.is_credits_exhausted())
            .finish()
    }
}

/// Serializable view of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: ProviderId,
    pub active: bool,
    pub is_default: bool,
    pub credits_exhausted: bool,
    pub rate_limited: bool,
    pub requests_per_minute: u32,
    pub max_batch_size: usize,
    pub cost_per_image: f64,
    pub supported_sizes: Vec<(u32, u32)>,
    pub reliability: ReliabilityStats,
}

/// Holds provider records and answers routing questions.
#[derive(Debug)]
pub struct ProviderManager {
    records: RwLock<Vec<Arc<ProviderRecord>>>,
    round_robin: AtomicUsize,
    credit_timeout: Duration,
}

impl Default for ProviderManager {
    fn default() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
            credit_timeout: CREDIT_QUERY_TIMEOUT,
        }
    }
}

impl ProviderManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credit_timeout(mut self, timeout: Duration) -> Self {
        self.credit_timeout = timeout;
        self
    }

    /// Add a provider. Ids must be unique.
    pub fn register(
        &self,
        id: impl Into<ProviderId>,
        gateway: SharedGateway,
        settings: ProviderSettings,
    ) -> Result<Arc<ProviderRecord>> {
        let id = id.into();
        let mut records = self.records.write();
        if records.iter().any(|r| r.id == id) {
            return Err(Error::Conflict(format!("provider '{id}' already registered")));
        }
        let record = Arc::new(ProviderRecord::new(id.clone(), gateway, settings));
        records.push(record.clone());
        tracing::info!(
            provider_id = %id,
            requests_per_minute = record.settings.requests_per_minute,
            active = record.is_active(),
            "Registered provider"
        );
        Ok(record)
    }

    /// Look up a record regardless of state.
    pub fn get(&self, id: &ProviderId) -> Option<Arc<ProviderRecord>> {
        self.records.read().iter().find(|r| &r.id == id).cloned()
    }

    /// Active provider by id.
    pub fn get_provider(&self, id: &ProviderId) -> Result<Arc<ProviderRecord>> {
        self.get(id)
            .filter(|r| r.is_active())
            .ok_or_else(|| Error::ProviderNotFound(id.clone()))
    }

    /// The active provider flagged as default.
    pub fn get_default(&self) -> Result<Arc<ProviderRecord>> {
        self.records
            .read()
            .iter()
            .find(|r| r.settings.is_default && r.is_active())
            .cloned()
            .ok_or(Error::NoProviderConfigured)
    }

    pub fn all(&self) -> Vec<Arc<ProviderRecord>> {
        self.records.read().clone()
    }

    pub fn active_providers(&self) -> Vec<Arc<ProviderRecord>> {
        self.records.read().iter().filter(|r| r.is_active()).cloned().collect()
    }

    /// Next provider in round-robin order, skipping inactive and credit-exhausted ones.
    pub fn next_round_robin(&self) -> Result<Arc<ProviderRecord>> {
        let candidates: Vec<_> = self
            .records
            .read()
            .iter()
            .filter(|r| r.is_selectable())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(Error::NoActiveProviders);
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }

    /// Cheapest selectable, non-rate-limited provider other than `exclude`.
    ///
    /// Among equally priced candidates, one with free limiter capacity wins.
    /// `eligible` lets the caller filter further, e.g. to providers with a
    /// running worker pool.
    pub fn select_fallback(
        &self,
        exclude: &ProviderId,
        eligible: impl Fn(&ProviderRecord) -> bool,
    ) -> Option<Arc<ProviderRecord>> {
        self.records
            .read()
            .iter()
            .filter(|r| &r.id != exclude && r.is_selectable() && !r.is_rate_limited() && eligible(r))
            .map(|r| (r, r.limiter.is_saturated()))
            .min_by(|(a, a_full), (b, b_full)| {
                a.settings
                    .cost_per_image
                    .total_cmp(&b.settings.cost_per_image)
                    .then(a_full.cmp(b_full))
            })
            .map(|(r, _)| r.clone())
    }

    pub fn deactivate(&self, id: &ProviderId) -> bool {
        self.set_active(id, false)
    }

    pub fn activate(&self, id: &ProviderId) -> bool {
        self.set_active(id, true)
    }

    fn set_active(&self, id: &ProviderId, active: bool) -> bool {
        match self.get(id) {
            Some(record) => {
                if record.active.swap(active, Ordering::SeqCst) != active {
                    tracing::info!(provider_id = %id, active, "Provider state changed");
                }
                true
            }
            None => false,
        }
    }

    pub fn mark_credits_exhausted(&self, id: &ProviderId) {
        if let Some(record) = self.get(id)
            && !record.credits_exhausted.swap(true, Ordering::SeqCst)
        {
            tracing::warn!(provider_id = %id, "Provider credits exhausted, excluding from selection");
        }
    }

    pub fn replenish(&self, id: &ProviderId) {
        if let Some(record) = self.get(id)
            && record.credits_exhausted.swap(false, Ordering::SeqCst)
        {
            tracing::info!(provider_id = %id, "Provider credits replenished");
        }
    }

    /// Treat the provider as rate limited for `cooldown`.
    pub fn mark_rate_limited(&self, id: &ProviderId, cooldown: Duration) {
        if let Some(record) = self.get(id) {
            let until = Instant::now() + cooldown;
            let mut current = record.rate_limited_until.lock();
            if current.is_none_or(|existing| existing < until) {
                *current = Some(until);
            }
        }
    }

    pub fn record_success(&self, id: &ProviderId, cost: f64) {
        if let Some(record) = self.get(id) {
            record.reliability.lock().record(true, cost);
        }
    }

    pub fn record_failure(&self, id: &ProviderId) {
        if let Some(record) = self.get(id) {
            record.reliability.lock().record(false, 0.0);
        }
    }

    /// Query every active provider's balance and update the exhausted flags.
    ///
    /// Returns the balances seen; providers that expose none report `None`.
    pub async fn refresh_credits(&self) -> Vec<(ProviderId, Option<f64>)> {
        let mut balances = Vec::new();
        for record in self.active_providers() {
            let queried = tokio::time::timeout(self.credit_timeout, record.gateway.remaining_credits()).await;
            let Ok(result) = queried else {
                tracing::warn!(
                    provider_id = %record.id,
                    timeout_ms = self.credit_timeout.as_millis() as u64,
                    "Timed out fetching remaining credits"
                );
                continue;
            };
            match result {
                Ok(Some(balance)) => {
                    if balance <= 0.0 {
                        self.mark_credits_exhausted(&record.id);
                    } else {
                        self.replenish(&record.id);
                    }
                    balances.push((record.id.clone(), Some(balance)));
                }
                Ok(None) => balances.push((record.id.clone(), None)),
                Err(e) => {
                    tracing::warn!(provider_id = %record.id, error = %e, "Failed to fetch remaining credits");
                }
            }
        }
        balances
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.records
            .read()
            .iter()
            .map(|r| ProviderInfo {
                id: r.id.clone(),
                active: r.is_active(),
                is_default: r.settings.is_default,
                credits_exhausted: r.is_credits_exhausted(),
                rate_limited: r.is_rate_limited(),
                requests_per_minute: r.settings.requests_per_minute,
                max_batch_size: r.settings.max_batch_size,
                cost_per_image: r.settings.cost_per_image,
                supported_sizes: r.gateway.supported_sizes(),
                reliability: r.reliability(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;

    fn settings(cost: f64) -> ProviderSettings {
        ProviderSettings {
            cost_per_image: cost,
            ..Default::default()
        }
    }

    fn manager_with(providers: &[(&str, f64)]) -> ProviderManager {
        let manager = ProviderManager::new();
        for (id, cost) in providers {
            manager
                .register(*id, Arc::new(MockProvider::new(*id)), settings(*cost))
                .unwrap();
        }
        manager
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let manager = manager_with(&[("a", 0.02)]);
        let err = manager
            .register("a", Arc::new(MockProvider::new("a")), settings(0.01))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_get_provider_requires_active() {
        let manager = manager_with(&[("a", 0.02)]);
        let id = ProviderId::from("a");

        assert!(manager.get_provider(&id).is_ok());
        assert!(manager.deactivate(&id));
        assert!(matches!(
            manager.get_provider(&id),
            Err(Error::ProviderNotFound(_))
        ));
        assert!(manager.get(&id).is_some());
        assert!(matches!(
            manager.get_provider(&ProviderId::from("missing")),
            Err(Error::ProviderNotFound(_))
        ));
    }

    #[test]
    fn test_get_default() {
        let manager = manager_with(&[("a", 0.02)]);
        assert!(matches!(manager.get_default(), Err(Error::NoProviderConfigured)));

        manager
            .register(
                "b",
                Arc::new(MockProvider::new("b")),
                ProviderSettings {
                    is_default: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(manager.get_default().unwrap().id().as_str(), "b");

        manager.deactivate(&ProviderId::from("b"));
        assert!(matches!(manager.get_default(), Err(Error::NoProviderConfigured)));
    }

    #[test]
    fn test_round_robin_skips_exhausted() {
        let manager = manager_with(&[("a", 0.02), ("b", 0.02), ("c", 0.02)]);

        let picks: Vec<String> = (0..6)
            .map(|_| manager.next_round_robin().unwrap().id().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);

        manager.mark_credits_exhausted(&ProviderId::from("b"));
        for _ in 0..4 {
            assert_ne!(manager.next_round_robin().unwrap().id().as_str(), "b");
        }

        manager.mark_credits_exhausted(&ProviderId::from("a"));
        manager.deactivate(&ProviderId::from("c"));
        assert!(matches!(manager.next_round_robin(), Err(Error::NoActiveProviders)));

        manager.replenish(&ProviderId::from("a"));
        assert_eq!(manager.next_round_robin().unwrap().id().as_str(), "a");
    }

    #[tokio::test]
    async fn test_fallback_picks_cheapest_available() {
        let manager = manager_with(&[("pricey", 0.08), ("cheap", 0.01), ("mid", 0.04)]);
        let any = |_: &ProviderRecord| true;

        let pick = manager.select_fallback(&ProviderId::from("pricey"), any).unwrap();
        assert_eq!(pick.id().as_str(), "cheap");

        // The failing provider is never its own fallback.
        let pick = manager.select_fallback(&ProviderId::from("cheap"), any).unwrap();
        assert_eq!(pick.id().as_str(), "mid");

        manager.mark_rate_limited(&ProviderId::from("mid"), Duration::from_secs(60));
        let pick = manager.select_fallback(&ProviderId::from("cheap"), any).unwrap();
        assert_eq!(pick.id().as_str(), "pricey");

        manager.mark_credits_exhausted(&ProviderId::from("pricey"));
        assert!(manager.select_fallback(&ProviderId::from("cheap"), any).is_none());

        let only_mid = |r: &ProviderRecord| r.id().as_str() == "mid";
        assert!(manager.select_fallback(&ProviderId::from("pricey"), only_mid).is_none());
    }

    #[tokio::test]
    async fn test_full_limiter_does_not_exclude_fallback() {
        let manager = ProviderManager::new();
        for (id, rpm) in [("primary", 60), ("busy", 1), ("idle", 60)] {
            manager
                .register(
                    id,
                    Arc::new(MockProvider::new(id)),
                    ProviderSettings {
                        requests_per_minute: rpm,
                        cost_per_image: 0.02,
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        let busy = manager.get(&ProviderId::from("busy")).unwrap();
        busy.limiter().acquire().await;
        assert!(busy.limiter().is_saturated());
        assert!(!busy.is_rate_limited());

        // Same price: the one with capacity ranks first.
        let any = |_: &ProviderRecord| true;
        let pick = manager.select_fallback(&ProviderId::from("primary"), any).unwrap();
        assert_eq!(pick.id().as_str(), "idle");

        // A busy provider is still a valid fallback when it is the only one.
        manager.deactivate(&ProviderId::from("idle"));
        let pick = manager.select_fallback(&ProviderId::from("primary"), any).unwrap();
        assert_eq!(pick.id().as_str(), "busy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_cooldown_expires() {
        let manager = manager_with(&[("a", 0.02)]);
        let id = ProviderId::from("a");
        let record = manager.get(&id).unwrap();

        manager.mark_rate_limited(&id, Duration::from_secs(30));
        assert!(record.is_rate_limited());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!record.is_rate_limited());
    }

    #[tokio::test]
    async fn test_refresh_credits_updates_exhaustion() {
        let manager = ProviderManager::new();
        let funded = Arc::new(MockProvider::new("funded").with_credits(50.0));
        let broke = Arc::new(MockProvider::new("broke").with_credits(0.0));
        let opaque = Arc::new(MockProvider::new("opaque"));
        manager.register("funded", funded.clone(), settings(0.02)).unwrap();
        manager.register("broke", broke.clone(), settings(0.02)).unwrap();
        manager.register("opaque", opaque, settings(0.02)).unwrap();

        let balances = manager.refresh_credits().await;
        assert_eq!(balances.len(), 3);
        assert!(balances.contains(&(ProviderId::from("opaque"), None)));
        assert!(manager.get(&ProviderId::from("broke")).unwrap().is_credits_exhausted());
        assert!(!manager.get(&ProviderId::from("funded")).unwrap().is_credits_exhausted());

        broke.set_credits(Some(25.0));
        manager.refresh_credits().await;
        assert!(!manager.get(&ProviderId::from("broke")).unwrap().is_credits_exhausted());
    }

    struct StalledBalance;

    #[async_trait::async_trait]
    impl crate::provider::ProviderGateway for StalledBalance {
        async fn generate(
            &self,
            _request: &crate::types::GenerationRequest,
        ) -> std::result::Result<crate::types::GenerationResponse, crate::provider::ProviderError> {
            Err(crate::provider::ProviderError::failed("unused"))
        }

        fn estimate_cost(&self, _request: &crate::types::GenerationRequest) -> f64 {
            0.0
        }

        async fn remaining_credits(&self) -> std::result::Result<Option<f64>, crate::provider::ProviderError> {
            std::future::pending().await
        }

        fn supported_sizes(&self) -> Vec<(u32, u32)> {
            Vec::new()
        }

        fn max_batch_size(&self) -> u32 {
            1
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_credits_skips_hanging_gateway() {
        let manager = ProviderManager::new().with_credit_timeout(Duration::from_secs(5));
        manager.register("stalled", Arc::new(StalledBalance), settings(0.02)).unwrap();
        manager
            .register("funded", Arc::new(MockProvider::new("funded").with_credits(12.0)), settings(0.02))
            .unwrap();

        let balances = manager.refresh_credits().await;
        assert_eq!(balances, vec![(ProviderId::from("funded"), Some(12.0))]);
        assert!(!manager.get(&ProviderId::from("stalled")).unwrap().is_credits_exhausted());
    }

    #[test]
    fn test_reliability_stats() {
        let manager = manager_with(&[("a", 0.02)]);
        let id = ProviderId::from("a");

        manager.record_success(&id, 0.02);
        manager.record_failure(&id);
        manager.record_failure(&id);
        manager.record_success(&id, 0.03);

        let stats = manager.get(&id).unwrap().reliability();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.successful_requests, 2);
        assert_eq!(stats.failed_requests, 2);
        assert_eq!(stats.consecutive_failures, 0);
        assert!((stats.total_cost - 0.05).abs() < 1e-9);
        assert!((stats.recent_success_rate - 0.5).abs() < 1e-9);

        let info = manager.list();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].reliability.total_requests, 4);
    }
}

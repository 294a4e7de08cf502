//! Operational monitoring: periodic samples, per-provider outcome history and
//! threshold alerts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::batch::{BatchEvent, BatchProcessor, EventListener};
use crate::config::MonitorConfig;
use crate::provider::ErrorCategory;
use crate::types::ProviderId;

/// Outcomes per provider summarized in each sample.
const SAMPLE_OUTCOMES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighFailureRate,
    SlowResponses,
    QueueBacklog,
    LowCredits,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighFailureRate => "high_failure_rate",
            Self::SlowResponses => "slow_responses",
            Self::QueueBacklog => "queue_backlog",
            Self::LowCredits => "low_credits",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Outcome {
    at: DateTime<Utc>,
    success: bool,
    response_time: Duration,
    cost: f64,
    category: Option<ErrorCategory>,
}

/// Recent figures for one provider within a sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSample {
    pub outcomes: usize,
    pub success_rate: f64,
    #[serde(with = "humantime_serde")]
    pub average_response_time: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub total_processed: u64,
    pub total_failed: u64,
    pub cache_hits: u64,
    /// Failure share of the recent outcomes across all providers
    pub failure_rate: f64,
    #[serde(with = "humantime_serde")]
    pub average_response_time: Duration,
    pub total_cost: f64,
    pub active_jobs: usize,
    pub in_flight: usize,
    pub queue_depths: BTreeMap<ProviderId, usize>,
    pub providers: BTreeMap<ProviderId, ProviderSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPerformance {
    pub provider: ProviderId,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub success_rate: f64,
    #[serde(with = "humantime_serde")]
    pub average_response_time: Duration,
    pub total_cost: f64,
    pub errors: BTreeMap<ErrorCategory, usize>,
}

/// Watches a [`BatchProcessor`] and raises alerts when thresholds are crossed.
pub struct BatchMonitor {
    config: MonitorConfig,
    processor: Arc<BatchProcessor>,
    outcomes: Mutex<HashMap<ProviderId, VecDeque<Outcome>>>,
    history: Mutex<VecDeque<MetricsSample>>,
    alerts: Mutex<Vec<Alert>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl BatchMonitor {
    pub fn new(config: MonitorConfig, processor: Arc<BatchProcessor>) -> Self {
        Self {
            config,
            processor,
            outcomes: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Subscribe to processor events and start sampling.
    pub fn start(self: &Arc<Self>) {
        self.processor.on(self.clone());

        let monitor = self.clone();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = monitor.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.sample().await;
                    }
                }
            }
            tracing::debug!("Monitor stopped");
        });
        tracing::info!(
            interval = %humantime::format_duration(self.config.sample_interval),
            "Batch monitor started"
        );
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Take a sample, record it, and evaluate alert rules.
    pub async fn sample(&self) -> MetricsSample {
        let metrics = self.processor.get_metrics();
        let (providers, failure_rate) = {
            let outcomes = self.outcomes.lock();
            let mut recent_total = 0;
            let mut recent_failed = 0;
            let providers = outcomes
                .iter()
                .map(|(id, ring)| {
                    let recent: Vec<&Outcome> = ring.iter().rev().take(SAMPLE_OUTCOMES).collect();
                    let successes = recent.iter().filter(|o| o.success).count();
                    recent_total += recent.len();
                    recent_failed += recent.len() - successes;
                    let sample = ProviderSample {
                        outcomes: recent.len(),
                        success_rate: ratio(successes, recent.len()),
                        average_response_time: average(recent.iter().map(|o| o.response_time)),
                    };
                    (id.clone(), sample)
                })
                .collect();
            (providers, ratio(recent_failed, recent_total))
        };

        let sample = MetricsSample {
            timestamp: Utc::now(),
            total_processed: metrics.total_processed,
            total_failed: metrics.total_failed,
            cache_hits: metrics.cache_hits,
            failure_rate,
            average_response_time: metrics.average_generation_time,
            total_cost: metrics.total_cost,
            active_jobs: metrics.active_jobs,
            in_flight: metrics.in_flight,
            queue_depths: metrics.queue_depths,
            providers,
        };

        {
            let mut history = self.history.lock();
            if history.len() >= self.config.history_size.max(1) {
                history.pop_front();
            }
            history.push_back(sample.clone());
        }

        self.check_thresholds(&sample).await;
        self.purge_expired_alerts(Utc::now());
        sample
    }

    async fn check_thresholds(&self, sample: &MetricsSample) {
        let thresholds = &self.config.thresholds;

        if sample.failure_rate >= thresholds.failure_rate && sample.failure_rate > 0.0 {
            self.raise_alert(
                AlertKind::HighFailureRate,
                Severity::Warning,
                format!("Failure rate {:.1}% over recent requests", sample.failure_rate * 100.0),
            );
        }

        if !sample.average_response_time.is_zero()
            && sample.average_response_time >= thresholds.response_time
        {
            self.raise_alert(
                AlertKind::SlowResponses,
                Severity::Warning,
                format!(
                    "Average response time {}",
                    humantime::format_duration(sample.average_response_time)
                ),
            );
        }

        for (provider, depth) in &sample.queue_depths {
            if *depth >= thresholds.queue_depth {
                self.raise_alert(
                    AlertKind::QueueBacklog,
                    Severity::Warning,
                    format!("Queue for provider {provider} holds {depth} items"),
                );
            }
        }

        for (provider, balance) in self.processor.registry().refresh_credits().await {
            if let Some(balance) = balance
                && balance <= thresholds.low_credits
            {
                self.raise_alert(
                    AlertKind::LowCredits,
                    Severity::Error,
                    format!("Provider {provider} has ${balance:.2} of credit left"),
                );
            }
        }
    }

    /// Record a new alert unless one of the same kind was raised within the dedup window.
    pub fn raise_alert(&self, kind: AlertKind, severity: Severity, message: String) -> Option<Alert> {
        let now = Utc::now();
        let mut alerts = self.alerts.lock();
        let duplicate = alerts
            .iter()
            .any(|a| a.kind == kind && age(a.created_at, now) < self.config.alert_dedup);
        if duplicate {
            tracing::trace!(kind = kind.as_str(), "Suppressed duplicate alert");
            return None;
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            kind,
            severity,
            message,
            created_at: now,
            resolved: false,
            resolved_at: None,
        };
        match severity {
            Severity::Warning => tracing::warn!(kind = kind.as_str(), alert_id = %alert.id, message = %alert.message, "Alert raised"),
            Severity::Error => tracing::error!(kind = kind.as_str(), alert_id = %alert.id, message = %alert.message, "Alert raised"),
        }
        metrics::counter!("volley_alerts_total", "type" => kind.as_str()).increment(1);
        alerts.push(alert.clone());
        Some(alert)
    }

    /// Returns `false` for unknown or already resolved alerts.
    pub fn resolve_alert(&self, id: Uuid) -> bool {
        let mut alerts = self.alerts.lock();
        match alerts.iter_mut().find(|a| a.id == id && !a.resolved) {
            Some(alert) => {
                alert.resolved = true;
                alert.resolved_at = Some(Utc::now());
                tracing::info!(alert_id = %id, kind = alert.kind.as_str(), "Alert resolved");
                true
            }
            None => false,
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().filter(|a| !a.resolved).cloned().collect()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    /// Drop alerts older than the retention period, resolved or not.
    pub fn purge_expired_alerts(&self, now: DateTime<Utc>) -> usize {
        let mut alerts = self.alerts.lock();
        let before = alerts.len();
        alerts.retain(|a| age(a.created_at, now) < self.config.alert_retention);
        before - alerts.len()
    }

    /// Outcome summary for one provider over the trailing `window`.
    pub fn provider_performance(&self, provider: &ProviderId, window: Duration) -> ProviderPerformance {
        let now = Utc::now();
        let outcomes = self.outcomes.lock();
        let recent: Vec<&Outcome> = outcomes
            .get(provider)
            .map(|ring| ring.iter().filter(|o| age(o.at, now) <= window).collect())
            .unwrap_or_default();

        let successful = recent.iter().filter(|o| o.success).count();
        let mut errors = BTreeMap::new();
        for category in recent.iter().filter_map(|o| o.category) {
            *errors.entry(category).or_default() += 1;
        }

        ProviderPerformance {
            provider: provider.clone(),
            window,
            total_requests: recent.len(),
            successful_requests: successful,
            failed_requests: recent.len() - successful,
            success_rate: ratio(successful, recent.len()),
            average_response_time: average(recent.iter().filter(|o| o.success).map(|o| o.response_time)),
            total_cost: recent.iter().map(|o| o.cost).sum(),
            errors,
        }
    }

    pub fn current_metrics(&self) -> Option<MetricsSample> {
        self.history.lock().back().cloned()
    }

    /// Samples taken within the trailing `since`.
    pub fn metrics_history(&self, since: Duration) -> Vec<MetricsSample> {
        let now = Utc::now();
        self.history
            .lock()
            .iter()
            .filter(|s| age(s.timestamp, now) <= since)
            .cloned()
            .collect()
    }

    pub fn export_json(&self) -> serde_json::Value {
        let active = self.active_alerts();
        serde_json::json!({
            "timestamp": Utc::now(),
            "current_metrics": self.current_metrics(),
            "active_alerts": active.len(),
            "alerts": active,
        })
    }

    fn record(&self, provider: &ProviderId, outcome: Outcome) {
        let mut outcomes = self.outcomes.lock();
        let ring = outcomes.entry(provider.clone()).or_default();
        if ring.len() >= self.config.outcome_window.max(1) {
            ring.pop_front();
        }
        ring.push_back(outcome);
    }
}

#[async_trait]
impl EventListener for BatchMonitor {
    async fn on_event(&self, event: &BatchEvent) -> anyhow::Result<()> {
        match event {
            // Cache hits never reached the provider.
            BatchEvent::ItemCompleted { cached: true, .. } => {}
            BatchEvent::ItemCompleted {
                provider,
                cost,
                generation_time,
                ..
            } => self.record(
                provider,
                Outcome {
                    at: Utc::now(),
                    success: true,
                    response_time: *generation_time,
                    cost: *cost,
                    category: None,
                },
            ),
            BatchEvent::ItemFailed {
                provider: Some(provider),
                category,
                ..
            } => self.record(
                provider,
                Outcome {
                    at: Utc::now(),
                    success: false,
                    response_time: Duration::ZERO,
                    cost: 0.0,
                    category: Some(*category),
                },
            ),
            BatchEvent::ItemFailed { provider: None, .. }
            | BatchEvent::BatchCompleted { .. }
            | BatchEvent::Progress { .. } => {}
        }
        Ok(())
    }
}

fn age(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - at).to_std().unwrap_or(Duration::ZERO)
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

fn average(durations: impl Iterator<Item = Duration>) -> Duration {
    let (sum, count) = durations.fold((Duration::ZERO, 0u32), |(sum, n), d| (sum + d, n + 1));
    if count == 0 { Duration::ZERO } else { sum / count }
}

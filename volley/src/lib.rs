//! # volley: batch image generation across rate-limited providers
//!
//! `volley` takes batches of image-generation requests and fans them out over
//! a set of third-party providers, each with its own request quota, pricing
//! and failure modes. Callers submit a batch and get a job id back
//! immediately; the work happens on background worker pools and the job can
//! be polled, cancelled, or followed through an event stream.
//!
//! ## Components
//!
//! - [`limiter`]: sliding-window limiter enforcing each provider's requests-per-minute quota.
//! - [`cache`]: response cache keyed by a canonical request fingerprint, with an
//!   in-memory tier in front of optional Redis and disk tiers.
//! - [`provider`]: the [`ProviderGateway`](provider::ProviderGateway) trait, an
//!   OpenAI-compatible adapter and a scriptable in-process provider.
//! - [`registry`]: configured providers, their runtime flags and routing choices
//!   (round robin, cheapest fallback).
//! - [`batch`]: jobs, items, per-provider queues and the
//!   [`BatchProcessor`](batch::BatchProcessor) that drives them, including
//!   retries, rate-limit backoff and cross-provider fallback.
//! - [`monitor`]: periodic samples, per-provider outcome history and threshold alerts.
//!
//! ## Lifecycle
//!
//! [`Application::new`] builds everything from a [`Config`](config::Config),
//! [`Application::start`] spawns the worker pools and background loops, and
//! [`Application::shutdown`] stops them again. Nothing is global: every
//! component is constructed here and shared by `Arc`.

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
pub mod monitor;
pub mod provider;
pub mod registry;
pub mod telemetry;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use batch::{BatchEvent, BatchProcessor, BatchSnapshot, JobId, JobStatus, ProcessorMetrics};
pub use cache::ResponseCache;
pub use config::Config;
pub use error::{Error, Result};
pub use monitor::BatchMonitor;
pub use registry::ProviderManager;
pub use types::{GenerationRequest, GenerationResponse, ProviderId};

use config::{ProviderConfig, ProviderKind};
use provider::{MockProvider, OpenAiImagesProvider, SharedGateway};

/// Build the gateway a provider entry describes.
fn build_gateway(provider: &ProviderConfig) -> SharedGateway {
    match &provider.kind {
        ProviderKind::Simulated {
            latency,
            failure_rate,
            credits,
        } => {
            let mut mock = MockProvider::new(provider.id.clone())
                .with_latency(*latency)
                .with_failure_rate(*failure_rate)
                .with_cost(provider.cost_per_image);
            if let Some(credits) = credits {
                mock = mock.with_credits(*credits);
            }
            Arc::new(mock)
        }
        ProviderKind::OpenAi {
            base_url,
            api_key,
            model,
            timeout,
        } => Arc::new(
            OpenAiImagesProvider::new(provider.id.clone(), base_url.clone(), api_key.clone(), model.clone())
                .with_timeout(*timeout),
        ),
    }
}

/// The assembled engine.
pub struct Application {
    config: Config,
    registry: Arc<ProviderManager>,
    cache: Option<Arc<ResponseCache>>,
    processor: Arc<BatchProcessor>,
    monitor: Option<Arc<BatchMonitor>>,
    shutdown_token: CancellationToken,
    background_tasks: TaskTracker,
}

impl Application {
    /// Register providers, open cache tiers and construct the processor and monitor.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        tracing::debug!(providers = config.providers.len(), "Building application");

        let registry = Arc::new(ProviderManager::new());
        for provider in &config.providers {
            registry.register(provider.id.clone(), build_gateway(provider), provider.settings())?;
        }

        let cache = if config.cache.enabled {
            let cache = ResponseCache::from_config(&config.cache).await?;
            cache.warm().await;
            Some(Arc::new(cache))
        } else {
            tracing::info!("Response cache disabled");
            None
        };

        let processor = Arc::new(BatchProcessor::new(
            config.processor.clone(),
            registry.clone(),
            cache.clone(),
        ));

        let monitor = config
            .monitor
            .enabled
            .then(|| Arc::new(BatchMonitor::new(config.monitor.clone(), processor.clone())));

        Ok(Self {
            config,
            registry,
            cache,
            processor,
            monitor,
            shutdown_token: CancellationToken::new(),
            background_tasks: TaskTracker::new(),
        })
    }

    /// Spawn worker pools, the monitor and the cache sweeper.
    pub fn start(&self) {
        self.processor.start();
        if let Some(monitor) = &self.monitor {
            monitor.start();
        }
        if let Some(cache) = &self.cache {
            cache.spawn_sweeper(
                self.config.cache.sweep_interval,
                self.shutdown_token.clone(),
                &self.background_tasks,
            );
        }
        tracing::info!(
            providers = self.registry.active_providers().len(),
            cache = self.cache.is_some(),
            monitor = self.monitor.is_some(),
            "Engine started"
        );
    }

    /// Stop everything and wait for background work, including pending cache writes.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down engine...");
        if let Some(monitor) = &self.monitor {
            monitor.shutdown().await;
        }
        self.processor.shutdown().await;

        self.shutdown_token.cancel();
        self.background_tasks.close();
        self.background_tasks.wait().await;

        if let Some(cache) = &self.cache {
            cache.flush().await;
        }
    }

    pub fn submit_batch(
        &self,
        requests: Vec<GenerationRequest>,
        provider: Option<ProviderId>,
        priority: i32,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<JobId> {
        self.processor.submit_batch(requests, provider, priority, metadata)
    }

    pub fn get_batch_status(&self, job_id: JobId) -> Option<BatchSnapshot> {
        self.processor.get_batch_status(job_id)
    }

    pub fn cancel_batch(&self, job_id: JobId) -> bool {
        self.processor.cancel_batch(job_id)
    }

    pub fn get_metrics(&self) -> ProcessorMetrics {
        self.processor.get_metrics()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderManager> {
        &self.registry
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn processor(&self) -> &Arc<BatchProcessor> {
        &self.processor
    }

    pub fn monitor(&self) -> Option<&Arc<BatchMonitor>> {
        self.monitor.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, DiskCacheConfig, MonitorConfig};
    use std::time::Duration;

    fn simulated(id: &str, cost: f64) -> ProviderConfig {
        ProviderConfig {
            id: ProviderId::from(id),
            cost_per_image: cost,
            requests_per_minute: 600,
            max_batch_size: 2,
            ..Default::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_application_runs_batch_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            providers: vec![simulated("sandbox-a", 0.01), simulated("sandbox-b", 0.02)],
            cache: CacheConfig {
                disk: Some(DiskCacheConfig {
                    dir: dir.path().to_path_buf(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let app = Application::new(config).await.unwrap();
        app.start();

        let requests = (0..4)
            .map(|i| GenerationRequest::new(format!("tile {i}")))
            .collect();
        let job = app.submit_batch(requests, None, 0, BTreeMap::new()).unwrap();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(10),
            app.processor().wait_for_completion(job),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(snapshot.status, JobStatus::Completed);
        assert!((snapshot.total_cost - 0.06).abs() < 1e-9);
        assert_eq!(app.get_metrics().total_processed, 4);

        app.shutdown().await;
        let persisted = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(persisted, 4);
    }

    #[tokio::test]
    async fn test_application_without_cache_or_monitor() {
        let config = Config {
            providers: vec![simulated("sandbox", 0.02)],
            cache: CacheConfig {
                enabled: false,
                ..Default::default()
            },
            monitor: MonitorConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let app = Application::new(config).await.unwrap();
        assert!(app.cache().is_none());
        assert!(app.monitor().is_none());
        assert!(!app.cancel_batch(JobId::new()));
    }
}

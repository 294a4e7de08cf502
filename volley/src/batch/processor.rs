//! Orchestration core.
//!
//! Every active provider gets a fixed pool of workers reading its queue.
//! A worker owns an item from dequeue until it is completed, failed, or put
//! back on a queue; it suspends only on the rate limiter, on cache tier I/O
//! and on the provider call itself, and never while holding a job lock.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::events::{BatchEvent, EventBus, EventListener};
use super::queue::ProviderQueue;
use super::{BatchItem, BatchJob, BatchSnapshot, ItemId, ItemStatus, JobId, JobStatus, Progress};
use crate::cache::ResponseCache;
use crate::config::ProcessorConfig;
use crate::error::{Error, Result};
use crate::provider::{ErrorCategory, ProviderError};
use crate::registry::{ProviderManager, ProviderRecord};
use crate::types::{GenerationRequest, GenerationResponse, ProviderId};

/// Aggregate processor figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorMetrics {
    /// Items completed, including cache hits
    pub total_processed: u64,
    pub total_failed: u64,
    pub cache_hits: u64,
    pub total_cost: f64,
    /// Moving average over the most recent provider calls
    #[serde(with = "humantime_serde")]
    pub average_generation_time: Duration,
    pub samples: usize,
    pub active_jobs: usize,
    pub in_flight: usize,
    pub queue_depths: BTreeMap<ProviderId, usize>,
}

#[derive(Debug, Default)]
struct RunningStats {
    processed: u64,
    failed: u64,
    cache_hits: u64,
    total_cost: f64,
    generation_times: VecDeque<Duration>,
}

/// What happens to an item after a failed attempt.
enum Disposition {
    Requeue {
        target: Arc<ProviderRecord>,
        delay: Duration,
    },
    Fail,
    /// The job was cancelled while the attempt was in flight
    Drop,
}

pub struct BatchProcessor {
    config: ProcessorConfig,
    registry: Arc<ProviderManager>,
    cache: Option<Arc<ResponseCache>>,
    queues: HashMap<ProviderId, Arc<ProviderQueue>>,
    /// Providers with a running worker pool
    pools: RwLock<HashSet<ProviderId>>,
    jobs: DashMap<JobId, Arc<BatchJob>>,
    events: EventBus,
    stats: Mutex<RunningStats>,
    in_flight: AtomicUsize,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl BatchProcessor {
    /// Create a processor with one queue per provider currently registered.
    pub fn new(
        config: ProcessorConfig,
        registry: Arc<ProviderManager>,
        cache: Option<Arc<ResponseCache>>,
    ) -> Self {
        let queues = registry
            .all()
            .into_iter()
            .map(|record| {
                let id = record.id().clone();
                (id.clone(), Arc::new(ProviderQueue::new(id)))
            })
            .collect();

        Self {
            events: EventBus::new(config.event_buffer),
            config,
            registry,
            cache,
            queues,
            pools: RwLock::new(HashSet::new()),
            jobs: DashMap::new(),
            stats: Mutex::new(RunningStats::default()),
            in_flight: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderManager> {
        &self.registry
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Spawn a worker pool for every active provider, plus job housekeeping.
    ///
    /// Pool sizes are fixed here: `min(max_batch_size, max_concurrent)` workers per provider.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Batch processor already started");
            return;
        }

        for record in self.registry.active_providers() {
            let Some(queue) = self.queues.get(record.id()).cloned() else {
                tracing::warn!(provider_id = %record.id(), "Provider registered after processor creation, no pool started");
                continue;
            };
            let workers = record
                .settings()
                .max_batch_size
                .min(self.config.max_concurrent)
                .max(1);
            self.pools.write().insert(record.id().clone());

            for worker in 0..workers {
                let processor = self.clone();
                let record = record.clone();
                let queue = queue.clone();
                self.tasks
                    .spawn(async move { processor.worker_loop(record, queue, worker).await });
            }
            tracing::info!(provider_id = %record.id(), workers, "Started worker pool");
        }

        let processor = self.clone();
        self.tasks.spawn(async move { processor.housekeeping_loop().await });
    }

    /// Stop worker pools and pending retries. In-flight provider calls finish first.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Batch processor stopped");
    }

    /// Deliver all events to `listener` until shutdown.
    pub fn on(&self, listener: Arc<dyn EventListener>) {
        self.events
            .attach(listener, self.shutdown.clone(), &self.tasks);
    }

    pub fn subscribe(&self, job: Option<JobId>) -> Pin<Box<dyn Stream<Item = BatchEvent> + Send>> {
        self.events.subscribe(job)
    }

    /// Create a job and enqueue its items. Returns without waiting for any work.
    ///
    /// Items go to `provider` when given, otherwise round robin across
    /// selectable providers.
    #[tracing::instrument(skip(self, requests, metadata), fields(count = requests.len()))]
    pub fn submit_batch(
        &self,
        requests: Vec<GenerationRequest>,
        provider: Option<ProviderId>,
        priority: i32,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<JobId> {
        if requests.is_empty() {
            return Err(Error::InvalidRequest(
                "batch must contain at least one request".to_string(),
            ));
        }
        for (index, request) in requests.iter().enumerate() {
            request.validate().map_err(|e| match e {
                Error::InvalidRequest(message) => {
                    Error::InvalidRequest(format!("request {index}: {message}"))
                }
                other => other,
            })?;
        }

        let routed: Vec<(GenerationRequest, ProviderId)> = match &provider {
            Some(id) => {
                let record = self.registry.get_provider(id)?;
                if !self.is_routable(record.id()) {
                    return Err(Error::ProviderNotFound(id.clone()));
                }
                requests.into_iter().map(|r| (r, id.clone())).collect()
            }
            None => {
                let mut routed = Vec::with_capacity(requests.len());
                for request in requests {
                    let record = self.next_routable()?;
                    routed.push((request, record.id().clone()));
                }
                routed
            }
        };

        let targets: Vec<ProviderId> = routed.iter().map(|(_, p)| p.clone()).collect();
        let job = Arc::new(BatchJob::new(provider, priority, metadata, routed));
        self.jobs.insert(job.id, job.clone());

        for (index, target) in targets.iter().enumerate() {
            if let Some(queue) = self.queues.get(target) {
                queue.push(job.clone(), index, priority);
            }
        }

        metrics::counter!("volley_batches_submitted_total").increment(1);
        metrics::counter!("volley_items_submitted_total").increment(targets.len() as u64);
        tracing::info!(job_id = %job.id, items = targets.len(), priority, "Batch submitted");

        Ok(job.id)
    }

    /// Point-in-time snapshot, or `None` for unknown ids.
    pub fn get_batch_status(&self, job_id: JobId) -> Option<BatchSnapshot> {
        self.job(job_id).map(|job| job.snapshot())
    }

    /// Cancel every not-yet-started item and settle the job.
    ///
    /// Returns `false` for unknown or already finished jobs.
    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    pub fn cancel_batch(&self, job_id: JobId) -> bool {
        let Some(job) = self.job(job_id) else {
            return false;
        };
        let (resolved, progress, total_cost) = {
            let mut state = job.lock();
            let resolved = state.cancel();
            (resolved, state.progress(), state.total_cost)
        };
        let Some(status) = resolved else {
            return false;
        };

        let dequeued: usize = self.queues.values().map(|q| q.remove_job(job_id)).sum();
        tracing::info!(
            dequeued,
            in_flight = progress.processing,
            "Batch cancelled"
        );
        self.events.emit(BatchEvent::Progress { job_id, progress });
        self.finish_job(&job, status, total_cost, progress);
        true
    }

    /// Wait until the job settles. Returns `None` for unknown ids.
    pub async fn wait_for_completion(&self, job_id: JobId) -> Option<BatchSnapshot> {
        // Subscribe before checking so the completion event cannot slip past.
        let mut events = self.subscribe(Some(job_id));
        loop {
            let snapshot = self.get_batch_status(job_id)?;
            if snapshot.status.is_terminal() {
                return Some(snapshot);
            }
            tokio::select! {
                event = events.next() => {
                    if event.is_none() {
                        return self.get_batch_status(job_id);
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    pub fn get_metrics(&self) -> ProcessorMetrics {
        let (total_processed, total_failed, cache_hits, total_cost, average, samples) = {
            let stats = self.stats.lock();
            let samples = stats.generation_times.len();
            let average = if samples == 0 {
                Duration::ZERO
            } else {
                stats.generation_times.iter().sum::<Duration>() / samples as u32
            };
            (
                stats.processed,
                stats.failed,
                stats.cache_hits,
                stats.total_cost,
                average,
                samples,
            )
        };

        let active_jobs = self
            .jobs
            .iter()
            .filter(|job| !job.status().is_terminal())
            .count();

        ProcessorMetrics {
            total_processed,
            total_failed,
            cache_hits,
            total_cost,
            average_generation_time: average,
            samples,
            active_jobs,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            queue_depths: self.queue_depths(),
        }
    }

    pub fn queue_depths(&self) -> BTreeMap<ProviderId, usize> {
        self.queues
            .iter()
            .map(|(id, queue)| (id.clone(), queue.len()))
            .collect()
    }

    /// Drop settled jobs older than `retention`, returning how many were removed.
    pub fn prune_jobs(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            let state = job.lock();
            let expired = state.status.is_terminal()
                && state
                    .completed_at
                    .is_some_and(|at| (now - at).to_std().is_ok_and(|age| age >= retention));
            !expired
        });
        before.saturating_sub(self.jobs.len())
    }

    fn job(&self, job_id: JobId) -> Option<Arc<BatchJob>> {
        self.jobs.get(&job_id).map(|entry| entry.value().clone())
    }

    /// Has a queue, and a running pool once the processor is started.
    fn is_routable(&self, id: &ProviderId) -> bool {
        self.queues.contains_key(id)
            && (!self.started.load(Ordering::SeqCst) || self.pools.read().contains(id))
    }

    fn next_routable(&self) -> Result<Arc<ProviderRecord>> {
        for _ in 0..self.queues.len().max(1) {
            let record = self.registry.next_round_robin()?;
            if self.is_routable(record.id()) {
                return Ok(record);
            }
        }
        Err(Error::NoActiveProviders)
    }

    fn select_fallback(&self, from: &ProviderId) -> Option<Arc<ProviderRecord>> {
        self.registry
            .select_fallback(from, |record| self.is_routable(record.id()))
    }

    async fn worker_loop(
        self: Arc<Self>,
        provider: Arc<ProviderRecord>,
        queue: Arc<ProviderQueue>,
        worker: usize,
    ) {
        tracing::debug!(provider_id = %provider.id(), worker, "Worker started");
        while let Some(queued) = queue.pop(&self.shutdown).await {
            self.process_item(&provider, queued.job, queued.index).await;
        }
        tracing::debug!(provider_id = %provider.id(), worker, "Worker stopped");
    }

    async fn housekeeping_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.housekeeping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = self.prune_jobs(self.config.job_retention);
                    if pruned > 0 {
                        tracing::debug!(pruned, "Pruned settled jobs");
                    }
                    metrics::gauge!("volley_jobs_tracked").set(self.jobs.len() as f64);
                }
            }
        }
    }

    #[tracing::instrument(skip(self, provider, job), fields(job_id = %job.id, item = index, provider_id = %provider.id()))]
    async fn process_item(self: &Arc<Self>, provider: &Arc<ProviderRecord>, job: Arc<BatchJob>, index: usize) {
        let request = {
            let state = job.lock();
            let item = &state.items[index];
            if item.status != ItemStatus::Pending {
                tracing::trace!(status = ?item.status, "Skipping item that is no longer pending");
                return;
            }
            item.request.clone()
        };

        if !provider.is_active() {
            self.reroute_from_inactive(provider, &job, index);
            return;
        }

        if let Some(cache) = &self.cache
            && let Some(response) = cache.get(&request, provider.id()).await
        {
            tracing::debug!("Serving item from cache");
            self.complete_item(&job, index, provider.id(), response, true);
            return;
        }

        if let Err(error) = provider.gateway().validate(&request) {
            tracing::debug!(error = %error, "Provider cannot serve request");
            self.handle_failure(provider, &job, index, error);
            return;
        }

        tokio::select! {
            _ = provider.limiter().acquire() => {}
            _ = self.shutdown.cancelled() => return,
        }

        {
            let mut state = job.lock();
            let item = &mut state.items[index];
            if item.status != ItemStatus::Pending {
                return;
            }
            item.status = ItemStatus::Processing;
            item.provider = Some(provider.id().clone());
            item.started_at.get_or_insert_with(Utc::now);
            state.mark_started();
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = scopeguard::guard(&self.in_flight, |count| {
            count.fetch_sub(1, Ordering::SeqCst);
        });

        tracing::debug!("Calling provider");
        let started = Instant::now();
        let outcome = match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, provider.gateway().generate(&request))
                .await
                .unwrap_or(Err(ProviderError::Timeout(limit))),
            None => provider.gateway().generate(&request).await,
        };
        let elapsed = started.elapsed();
        drop(in_flight);

        match outcome {
            Ok(mut response) => {
                if response.generation_time.is_zero() {
                    response.generation_time = elapsed;
                }
                self.registry.record_success(provider.id(), response.cost);
                if let Some(cache) = &self.cache {
                    cache.set(&request, provider.id(), &response).await;
                }
                self.complete_item(&job, index, provider.id(), response, false);
            }
            Err(error) => {
                self.registry.record_failure(provider.id());
                metrics::counter!(
                    "volley_provider_errors_total",
                    "provider" => provider.id().to_string(),
                    "category" => error.category().as_str()
                )
                .increment(1);
                self.handle_failure(provider, &job, index, error);
            }
        }
    }

    fn complete_item(
        &self,
        job: &Arc<BatchJob>,
        index: usize,
        provider: &ProviderId,
        response: GenerationResponse,
        cached: bool,
    ) {
        let generation_time = response.generation_time;
        let (attempts, cost, progress, resolved, total_cost, late) = {
            let mut state = job.lock();
            let late = state.status.is_terminal();
            let item = &mut state.items[index];
            if item.status.is_terminal() {
                return;
            }
            let cost = if cached { 0.0 } else { response.cost };
            if !cached {
                item.attempts += 1;
                *item.provider_attempts.entry(provider.clone()).or_default() += 1;
            }
            item.status = ItemStatus::Completed;
            item.provider = Some(provider.clone());
            item.result = Some(response);
            item.error = None;
            item.error_category = None;
            item.cost = cost;
            item.cached = cached;
            item.completed_at = Some(Utc::now());
            let attempts = item.attempts;

            state.total_cost += cost;
            if state.status == JobStatus::Cancelled {
                // Finished in flight after cancellation.
                state.status = JobStatus::Partial;
            }
            state.mark_started();
            let resolved = state.try_resolve();
            (attempts, cost, state.progress(), resolved, state.total_cost, late)
        };

        {
            let mut stats = self.stats.lock();
            stats.processed += 1;
            stats.total_cost += cost;
            if cached {
                stats.cache_hits += 1;
            } else {
                if stats.generation_times.len() >= self.config.metrics_window {
                    stats.generation_times.pop_front();
                }
                stats.generation_times.push_back(generation_time);
            }
        }

        metrics::counter!(
            "volley_items_completed_total",
            "provider" => provider.to_string(),
            "cached" => cached.to_string()
        )
        .increment(1);
        if !cached {
            metrics::histogram!("volley_generation_seconds", "provider" => provider.to_string())
                .record(generation_time.as_secs_f64());
        }
        tracing::info!(job_id = %job.id, item = index, provider_id = %provider, attempts, cost, cached, "Item completed");

        self.events.emit(BatchEvent::ItemCompleted {
            item_id: ItemId { job: job.id, index },
            provider: provider.clone(),
            cost,
            generation_time,
            cached,
            attempts,
        });
        self.events.emit(BatchEvent::Progress {
            job_id: job.id,
            progress,
        });
        if let Some(status) = resolved {
            self.finish_job(job, status, total_cost, progress);
        } else if late {
            self.revise_finished_job(job);
        }
    }

    fn handle_failure(
        self: &Arc<Self>,
        provider: &Arc<ProviderRecord>,
        job: &Arc<BatchJob>,
        index: usize,
        error: ProviderError,
    ) {
        match &error {
            ProviderError::RateLimited { retry_after, .. } => self.registry.mark_rate_limited(
                provider.id(),
                retry_after.unwrap_or(self.config.rate_limit_cooldown),
            ),
            ProviderError::InsufficientCredits(_) => {
                self.registry.mark_credits_exhausted(provider.id())
            }
            _ => {}
        }

        let category = error.category();
        let (disposition, attempts) = {
            let mut state = job.lock();
            let job_closed = state.status.is_terminal();
            let item = &mut state.items[index];
            item.error = Some(error.to_string());
            item.error_category = Some(category);

            let disposition = if job_closed {
                item.status = ItemStatus::Cancelled;
                item.completed_at = Some(Utc::now());
                Disposition::Drop
            } else {
                let disposition = self.decide(provider, item, &error);
                if let Disposition::Requeue { target, .. } = &disposition {
                    item.status = ItemStatus::Pending;
                    item.provider = Some(target.id().clone());
                }
                disposition
            };
            (disposition, item.attempts)
        };

        match disposition {
            Disposition::Drop => {
                tracing::debug!(job_id = %job.id, item = index, error = %error, "Job cancelled during attempt, not retrying");
                self.revise_finished_job(job);
            }
            Disposition::Requeue { target, delay } => {
                tracing::info!(
                    job_id = %job.id,
                    item = index,
                    from = %provider.id(),
                    to = %target.id(),
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Requeueing item"
                );
                self.requeue(job, index, target.id(), delay);
            }
            Disposition::Fail => {
                self.fail_item(job, index, Some(provider.id().clone()), error.to_string(), category);
            }
        }
    }

    /// Retry policy. Called with the job lock held; mutates attempt counters only.
    fn decide(&self, provider: &Arc<ProviderRecord>, item: &mut BatchItem, error: &ProviderError) -> Disposition {
        let config = &self.config;

        if let ProviderError::RateLimited { retry_after, .. } = error
            && item.rate_limit_deferrals < config.max_rate_limit_retries
        {
            item.rate_limit_deferrals += 1;
            return Disposition::Requeue {
                target: provider.clone(),
                delay: self.rate_limit_backoff(item.rate_limit_deferrals, *retry_after),
            };
        }

        item.attempts += 1;
        *item.provider_attempts.entry(provider.id().clone()).or_default() += 1;
        if item.attempts >= config.max_retries {
            return Disposition::Fail;
        }

        match error {
            ProviderError::RateLimited { retry_after, .. } => match self.select_fallback(provider.id()) {
                Some(target) => Disposition::Requeue {
                    target,
                    delay: Duration::ZERO,
                },
                None => Disposition::Requeue {
                    target: provider.clone(),
                    delay: self.rate_limit_backoff(item.rate_limit_deferrals.max(1), *retry_after),
                },
            },
            ProviderError::InsufficientCredits(_) | ProviderError::Unsupported(_) => {
                match self.select_fallback(provider.id()) {
                    Some(target) => Disposition::Requeue {
                        target,
                        delay: Duration::ZERO,
                    },
                    None => Disposition::Fail,
                }
            }
            ProviderError::Timeout(_) | ProviderError::Unauthorized(_) | ProviderError::Failed(_) => {
                let delay = config.retry_delay * item.attempts;
                if item.attempts_on(provider.id()) >= config.max_attempts_per_provider
                    && let Some(target) = self.select_fallback(provider.id())
                {
                    Disposition::Requeue { target, delay }
                } else {
                    Disposition::Requeue {
                        target: provider.clone(),
                        delay,
                    }
                }
            }
        }
    }

    /// `retry_delay * 2^(n-1)`, at least `retry_after`, capped at `max_backoff`.
    fn rate_limit_backoff(&self, deferrals: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = deferrals.saturating_sub(1).min(16);
        let backoff = self.config.retry_delay.saturating_mul(1 << exponent);
        retry_after
            .map_or(backoff, |hint| hint.max(backoff))
            .min(self.config.max_backoff)
    }

    fn requeue(self: &Arc<Self>, job: &Arc<BatchJob>, index: usize, target: &ProviderId, delay: Duration) {
        let Some(queue) = self.queues.get(target).cloned() else {
            tracing::error!(job_id = %job.id, item = index, provider_id = %target, "No queue for retry target");
            self.fail_item(
                job,
                index,
                Some(target.clone()),
                format!("no queue for provider {target}"),
                ErrorCategory::Other,
            );
            return;
        };
        let priority = job.priority;

        if delay.is_zero() {
            queue.push(job.clone(), index, priority);
            return;
        }

        let job = job.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.push(job, index, priority),
            }
        });
    }

    /// Move an item off a provider deactivated since it was queued.
    fn reroute_from_inactive(self: &Arc<Self>, provider: &Arc<ProviderRecord>, job: &Arc<BatchJob>, index: usize) {
        match self.select_fallback(provider.id()) {
            Some(target) => {
                {
                    let mut state = job.lock();
                    let item = &mut state.items[index];
                    if item.status != ItemStatus::Pending {
                        return;
                    }
                    item.provider = Some(target.id().clone());
                }
                tracing::info!(job_id = %job.id, item = index, from = %provider.id(), to = %target.id(), "Rerouting item from inactive provider");
                self.requeue(job, index, target.id(), Duration::ZERO);
            }
            None => self.fail_item(
                job,
                index,
                Some(provider.id().clone()),
                format!("provider {} is inactive and no alternative is available", provider.id()),
                ErrorCategory::Other,
            ),
        }
    }

    fn fail_item(
        &self,
        job: &Arc<BatchJob>,
        index: usize,
        provider: Option<ProviderId>,
        error: String,
        category: ErrorCategory,
    ) {
        let (attempts, progress, resolved, total_cost) = {
            let mut state = job.lock();
            let item = &mut state.items[index];
            if item.status.is_terminal() {
                return;
            }
            item.status = ItemStatus::Failed;
            item.error = Some(error.clone());
            item.error_category = Some(category);
            item.completed_at = Some(Utc::now());
            let attempts = item.attempts;
            state.mark_started();
            let resolved = state.try_resolve();
            (attempts, state.progress(), resolved, state.total_cost)
        };

        self.stats.lock().failed += 1;
        metrics::counter!(
            "volley_items_failed_total",
            "provider" => provider.as_ref().map(|p| p.to_string()).unwrap_or_default(),
            "category" => category.as_str()
        )
        .increment(1);
        tracing::warn!(job_id = %job.id, item = index, provider_id = ?provider, attempts, error = %error, "Item failed permanently");

        self.events.emit(BatchEvent::ItemFailed {
            item_id: ItemId { job: job.id, index },
            provider,
            error,
            category,
            attempts,
        });
        self.events.emit(BatchEvent::Progress {
            job_id: job.id,
            progress,
        });
        if let Some(status) = resolved {
            self.finish_job(job, status, total_cost, progress);
        }
    }

    fn finish_job(&self, job: &Arc<BatchJob>, status: JobStatus, total_cost: f64, progress: Progress) {
        tracing::info!(
            job_id = %job.id,
            status = status.as_str(),
            completed = progress.completed,
            failed = progress.failed,
            cancelled = progress.cancelled,
            total_cost,
            "Batch finished"
        );
        metrics::counter!("volley_batches_finished_total", "status" => status.as_str()).increment(1);
        self.events.emit(BatchEvent::BatchCompleted {
            job_id: job.id,
            status,
            total_cost,
            progress,
        });
    }

    /// Re-announce a settled job after an in-flight item landed on it.
    ///
    /// Only cancelled jobs can still have items in flight. The repeated
    /// `BatchCompleted` carries the current status, cost and progress so the
    /// last one a listener sees matches the final snapshot.
    fn revise_finished_job(&self, job: &Arc<BatchJob>) {
        let (status, total_cost, progress) = {
            let state = job.lock();
            (state.status, state.total_cost, state.progress())
        };
        tracing::info!(
            job_id = %job.id,
            status = status.as_str(),
            completed = progress.completed,
            in_flight = progress.processing,
            total_cost,
            "Batch result revised after cancellation"
        );
        self.events.emit(BatchEvent::BatchCompleted {
            job_id: job.id,
            status,
            total_cost,
            progress,
        });
    }
}

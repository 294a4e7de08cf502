//! Batch jobs, their items, and the processor that drives them.
//!
//! A job owns its items for their whole lifetime. Item and job state live
//! behind one per-job lock so that concurrent workers updating different
//! items of the same job always leave a consistent snapshot.

pub mod events;
pub mod processor;
pub mod queue;


use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::ErrorCategory;
use crate::types::{GenerationRequest, GenerationResponse, ProviderId};

pub use events::{BatchEvent, EventBus, EventListener};
pub use processor::{BatchProcessor, ProcessorMetrics};

/// Identifier of a submitted batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short, readable form like "batch_1a2b3c4d" for logs.
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:x}", self.0.as_u128());
        format!("batch_{}", &hex[..8.min(hex.len())])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one item: its job plus its position in the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub job: JobId,
    pub index: usize,
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.job.to_short_string(), self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal status for a job whose items ended with these counts.
    pub fn resolve(completed: usize, failed: usize, cancelled: usize) -> Self {
        if cancelled > 0 {
            if completed > 0 { Self::Partial } else { Self::Cancelled }
        } else if failed == 0 {
            Self::Completed
        } else if completed == 0 {
            Self::Failed
        } else {
            Self::Partial
        }
    }
}

/// One request within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: ItemId,
    pub request: GenerationRequest,
    pub status: ItemStatus,
    /// Provider attempts so far, across all providers
    pub attempts: u32,
    /// Attempts per provider
    pub provider_attempts: BTreeMap<ProviderId, u32>,
    /// Rate-limit backoffs that did not count as attempts
    pub rate_limit_deferrals: u32,
    /// Provider the item is queued on, or that served its last attempt
    pub provider: Option<ProviderId>,
    pub result: Option<GenerationResponse>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    /// Realized cost; zero for cache hits
    pub cost: f64,
    pub cached: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchItem {
    fn new(id: ItemId, request: GenerationRequest, provider: ProviderId) -> Self {
        Self {
            id,
            request,
            status: ItemStatus::Pending,
            attempts: 0,
            provider_attempts: BTreeMap::new(),
            rate_limit_deferrals: 0,
            provider: Some(provider),
            result: None,
            error: None,
            error_category: None,
            cost: 0.0,
            cached: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn attempts_on(&self, provider: &ProviderId) -> u32 {
        self.provider_attempts.get(provider).copied().unwrap_or(0)
    }
}

/// Literal item counts of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Share of items in a terminal state, 0-100
    pub percent: f64,
}

impl Progress {
    fn of(items: &[BatchItem]) -> Self {
        let mut progress = Self {
            total: items.len(),
            ..Default::default()
        };
        for item in items {
            match item.status {
                ItemStatus::Pending => progress.pending += 1,
                ItemStatus::Processing => progress.processing += 1,
                ItemStatus::Completed => progress.completed += 1,
                ItemStatus::Failed => progress.failed += 1,
                ItemStatus::Cancelled => progress.cancelled += 1,
            }
        }
        let done = progress.completed + progress.failed + progress.cancelled;
        if progress.total > 0 {
            progress.percent = done as f64 * 100.0 / progress.total as f64;
        }
        progress
    }

    pub fn is_done(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// Mutable part of a job.
#[derive(Debug)]
pub(crate) struct JobState {
    pub status: JobStatus,
    pub items: Vec<BatchItem>,
    pub total_cost: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn progress(&self) -> Progress {
        Progress::of(&self.items)
    }

    /// Mark the job started on its first claimed item.
    pub fn mark_started(&mut self) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Processing;
            self.started_at = Some(Utc::now());
        }
    }

    /// Settle the job once every item is terminal. Returns the new status if it changed.
    pub fn try_resolve(&mut self) -> Option<JobStatus> {
        if self.status.is_terminal() {
            return None;
        }
        let progress = self.progress();
        if !progress.is_done() {
            return None;
        }
        self.status = JobStatus::resolve(progress.completed, progress.failed, progress.cancelled);
        self.completed_at = Some(Utc::now());
        Some(self.status)
    }

    /// Cancel every pending item and settle the job immediately.
    ///
    /// Items already in flight keep running; their results still land on the job.
    pub fn cancel(&mut self) -> Option<JobStatus> {
        if self.status.is_terminal() {
            return None;
        }
        let now = Utc::now();
        for item in self.items.iter_mut().filter(|i| i.status == ItemStatus::Pending) {
            item.status = ItemStatus::Cancelled;
            item.completed_at = Some(now);
        }
        let progress = self.progress();
        self.status = if progress.completed > 0 {
            JobStatus::Partial
        } else {
            JobStatus::Cancelled
        };
        self.completed_at = Some(now);
        Some(self.status)
    }
}

/// A submitted batch.
#[derive(Debug)]
pub struct BatchJob {
    pub id: JobId,
    /// Explicit provider, if the caller chose one
    pub provider: Option<ProviderId>,
    pub priority: i32,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    state: Mutex<JobState>,
}

impl BatchJob {
    pub(crate) fn new(
        provider: Option<ProviderId>,
        priority: i32,
        metadata: BTreeMap<String, serde_json::Value>,
        routed: Vec<(GenerationRequest, ProviderId)>,
    ) -> Self {
        let id = JobId::new();
        let items = routed
            .into_iter()
            .enumerate()
            .map(|(index, (request, provider))| {
                BatchItem::new(ItemId { job: id, index }, request, provider)
            })
            .collect();
        Self {
            id,
            provider,
            priority,
            metadata,
            created_at: Utc::now(),
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                items,
                total_cost: 0.0,
                started_at: None,
                completed_at: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock()
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let state = self.state.lock();
        BatchSnapshot {
            id: self.id,
            status: state.status,
            provider: self.provider.clone(),
            priority: self.priority,
            metadata: self.metadata.clone(),
            progress: state.progress(),
            total_cost: state.total_cost,
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            items: state.items.clone(),
        }
    }
}

/// Point-in-time view of a job, coherent even while workers are running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub provider: Option<ProviderId>,
    pub priority: i32,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub progress: Progress,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items: Vec<BatchItem>,
}

//! Batch lifecycle events and their delivery.
//!
//! Events go out over a broadcast channel. Emitting never blocks a worker: a
//! slow listener lags and drops events rather than applying backpressure, and
//! a failing or panicking listener is logged and keeps running.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{ItemId, JobId, JobStatus, Progress};
use crate::provider::ErrorCategory;
use crate::types::ProviderId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    ItemCompleted {
        item_id: ItemId,
        provider: ProviderId,
        cost: f64,
        #[serde(with = "humantime_serde")]
        generation_time: Duration,
        cached: bool,
        attempts: u32,
    },
    ItemFailed {
        item_id: ItemId,
        provider: Option<ProviderId>,
        error: String,
        category: ErrorCategory,
        attempts: u32,
    },
    /// The job settled. A cancelled job emits this again each time an
    /// in-flight item lands afterwards; the last one matches the final status.
    BatchCompleted {
        job_id: JobId,
        status: JobStatus,
        total_cost: f64,
        progress: Progress,
    },
    Progress {
        job_id: JobId,
        progress: Progress,
    },
}

impl BatchEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::ItemCompleted { item_id, .. } | Self::ItemFailed { item_id, .. } => item_id.job,
            Self::BatchCompleted { job_id, .. } | Self::Progress { job_id, .. } => *job_id,
        }
    }
}

/// Receiver of batch events, e.g. a webhook dispatcher or the monitor.
#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    async fn on_event(&self, event: &BatchEvent) -> anyhow::Result<()>;
}

/// Fan-out of [`BatchEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<BatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: BatchEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Stream of events, optionally restricted to one job.
    pub fn subscribe(&self, job: Option<JobId>) -> Pin<Box<dyn Stream<Item = BatchEvent> + Send>> {
        let rx = self.sender.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
            Ok(event) if job.is_none_or(|id| event.job_id() == id) => Some(event),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Event subscriber lagged");
                None
            }
        });
        Box::pin(stream)
    }

    /// Deliver every event to `listener` on a background task until `shutdown` fires.
    pub fn attach(
        &self,
        listener: Arc<dyn EventListener>,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let mut rx = self.sender.subscribe();
        tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Event listener lagged, events dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                match AssertUnwindSafe(listener.on_event(&event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(job_id = %event.job_id(), error = %e, "Event listener failed");
                    }
                    Err(_) => {
                        tracing::error!(job_id = %event.job_id(), "Event listener panicked");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio_stream::StreamExt;

    fn progress_event(job_id: JobId) -> BatchEvent {
        BatchEvent::Progress {
            job_id,
            progress: Progress::default(),
        }
    }

    struct Recorder(Mutex<Vec<JobId>>);

    #[async_trait]
    impl EventListener for Recorder {
        async fn on_event(&self, event: &BatchEvent) -> anyhow::Result<()> {
            self.0.lock().push(event.job_id());
            Ok(())
        }
    }

    struct Exploding;

    #[async_trait]
    impl EventListener for Exploding {
        async fn on_event(&self, event: &BatchEvent) -> anyhow::Result<()> {
            if matches!(event, BatchEvent::Progress { .. }) {
                panic!("listener bug");
            }
            anyhow::bail!("webhook endpoint unreachable")
        }
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_job() {
        let bus = EventBus::new(16);
        let wanted = JobId::new();
        let mut stream = bus.subscribe(Some(wanted));

        bus.emit(progress_event(JobId::new()));
        bus.emit(progress_event(wanted));

        let event = stream.next().await.unwrap();
        assert_eq!(event.job_id(), wanted);
    }

    #[test_log::test(tokio::test)]
    async fn test_failing_listener_does_not_stop_others() {
        let bus = EventBus::new(16);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));

        bus.attach(Arc::new(Exploding), shutdown.clone(), &tracker);
        bus.attach(recorder.clone(), shutdown.clone(), &tracker);

        let jobs: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        for job in &jobs {
            bus.emit(progress_event(*job));
            bus.emit(BatchEvent::BatchCompleted {
                job_id: *job,
                status: JobStatus::Completed,
                total_cost: 0.0,
                progress: Progress::default(),
            });
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while recorder.0.lock().len() < 6 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.0.lock().len(), 6);

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let job_id = JobId::new();
        let json = serde_json::to_value(progress_event(job_id)).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["job_id"], job_id.to_string());
    }
}

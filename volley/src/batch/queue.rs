//! Per-provider priority queue feeding a worker pool.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{BatchJob, JobId};
use crate::types::ProviderId;

/// A queued reference to one item of a job.
pub struct QueuedItem {
    pub priority: i32,
    seq: u64,
    pub job: Arc<BatchJob>,
    pub index: usize,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedItem {}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedItem {
    /// Higher priority first, then earlier enqueue first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue for one provider.
///
/// Priority is a soft ordering hint: it orders the queue, but once several
/// workers are running, completion order is unconstrained. Re-enqueued items
/// get a fresh sequence number and may land behind newer work.
pub struct ProviderQueue {
    provider: ProviderId,
    heap: Mutex<BinaryHeap<QueuedItem>>,
    notify: Notify,
    seq: AtomicU64,
}

impl ProviderQueue {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn push(&self, job: Arc<BatchJob>, index: usize, priority: i32) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let depth = {
            let mut heap = self.heap.lock();
            heap.push(QueuedItem {
                priority,
                seq,
                job,
                index,
            });
            heap.len()
        };
        self.record_depth(depth);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<QueuedItem> {
        let (item, depth) = {
            let mut heap = self.heap.lock();
            let item = heap.pop();
            (item, heap.len())
        };
        if item.is_some() {
            self.record_depth(depth);
        }
        item
    }

    /// Wait for the next item, or `None` once `shutdown` fires.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<QueuedItem> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Drop every queued item of `job`, returning how many were removed.
    pub fn remove_job(&self, job: JobId) -> usize {
        let (removed, depth) = {
            let mut heap = self.heap.lock();
            let before = heap.len();
            heap.retain(|queued| queued.job.id != job);
            (before - heap.len(), heap.len())
        };
        self.record_depth(depth);
        removed
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    fn record_depth(&self, depth: usize) {
        metrics::gauge!("volley_queue_depth", "provider" => self.provider.to_string()).set(depth as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GenerationRequest;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn job(items: usize) -> Arc<BatchJob> {
        let routed = (0..items)
            .map(|i| (GenerationRequest::new(format!("p{i}")), ProviderId::from("a")))
            .collect();
        Arc::new(BatchJob::new(None, 0, BTreeMap::new(), routed))
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = ProviderQueue::new(ProviderId::from("a"));
        let low = job(2);
        let high = job(1);

        queue.push(low.clone(), 0, 0);
        queue.push(low.clone(), 1, 0);
        queue.push(high.clone(), 0, 10);

        let order: Vec<(JobId, usize)> = std::iter::from_fn(|| queue.try_pop())
            .map(|q| (q.job.id, q.index))
            .collect();
        assert_eq!(order, vec![(high.id, 0), (low.id, 0), (low.id, 1)]);
    }

    #[test]
    fn test_remove_job() {
        let queue = ProviderQueue::new(ProviderId::from("a"));
        let a = job(3);
        let b = job(1);
        for i in 0..3 {
            queue.push(a.clone(), i, 0);
        }
        queue.push(b.clone(), 0, 0);

        assert_eq!(queue.remove_job(a.id), 3);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop().map(|q| q.job.id), Some(b.id));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push_and_stops_on_shutdown() {
        let queue = Arc::new(ProviderQueue::new(ProviderId::from("a")));
        let shutdown = CancellationToken::new();

        let waiter = tokio::spawn({
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            async move { queue.pop(&shutdown).await.map(|q| q.index) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(job(1), 0, 0);
        assert_eq!(waiter.await.unwrap(), Some(0));

        let idle = tokio::spawn({
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            async move { queue.pop(&shutdown).await.is_none() }
        });
        shutdown.cancel();
        assert!(idle.await.unwrap());
    }
}

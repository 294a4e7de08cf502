//! Per-provider sliding-window admission control.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Default quota window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Timestamps of recent admissions within one rolling window.
///
/// Pure bookkeeping with no clock of its own, so it can be driven from tests
/// with synthetic instants.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            admitted: VecDeque::with_capacity(limit),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit at `now` if there is room, otherwise return how long until the
    /// oldest admission ages out.
    pub fn try_admit(&mut self, now: Instant) -> Result<(), Duration> {
        self.prune(now);
        if self.admitted.len() < self.limit {
            self.admitted.push_back(now);
            return Ok(());
        }
        let oldest = self.admitted.front().copied().unwrap_or(now);
        Err(self
            .window
            .saturating_sub(now.saturating_duration_since(oldest)))
    }

    /// Admissions still inside the window at `now`.
    pub fn occupancy(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.admitted.len()
    }
}

/// Bounds calls to one provider to `limit` per rolling window.
///
/// All admission decisions go through one lock. The lock is only held while
/// deciding; waiters sleep outside it and re-evaluate on wake-up.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Mutex<SlidingWindow>,
}

impl RateLimiter {
    /// Limiter admitting `requests_per_minute` calls per 60s.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute as usize, RATE_WINDOW)
    }

    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window: Mutex::new(SlidingWindow::new(limit, window)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait until a call is admissible, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = match self.window.lock().try_admit(Instant::now()) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Admit immediately if possible, without waiting.
    pub fn try_acquire(&self) -> bool {
        self.window.lock().try_admit(Instant::now()).is_ok()
    }

    /// Whether an `acquire` issued now would have to wait.
    pub fn is_saturated(&self) -> bool {
        self.in_window() >= self.limit
    }

    pub fn in_window(&self) -> usize {
        self.window.lock().occupancy(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_oldest_to_expire() {
        let limiter = RateLimiter::per_minute(2);
        let start = Instant::now();

        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.acquire().await;
        assert!(limiter.is_saturated());

        limiter.acquire().await;
        // The first admission left the window at t=60s.
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(60));
        assert!(waited < Duration::from_secs(61));
        assert_eq!(limiter.in_window(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquirers_respect_limit() {
        let limiter = Arc::new(RateLimiter::per_minute(3));
        let admitted = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                let admitted = admitted.clone();
                tokio::spawn(async move {
                    limiter.acquire().await;
                    admitted.lock().push(Instant::now());
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut times = admitted.lock().clone();
        times.sort();
        assert_eq!(times.len(), 10);
        for (i, start) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < RATE_WINDOW)
                .count();
            assert!(in_window <= 3, "{in_window} admissions within one window");
        }
    }

    #[test]
    fn test_try_acquire_does_not_wait() {
        let limiter = RateLimiter::per_minute(1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(limiter.is_saturated());
    }

    proptest! {
        #[test]
        fn window_never_exceeds_limit(
            limit in 1usize..8,
            gaps in prop::collection::vec(0u64..30_000, 1..200),
        ) {
            let window = Duration::from_secs(60);
            let mut sliding = SlidingWindow::new(limit, window);
            let base = Instant::now();
            let mut now = base;
            let mut admitted = Vec::new();

            for gap in gaps {
                now += Duration::from_millis(gap);
                match sliding.try_admit(now) {
                    Ok(()) => admitted.push(now),
                    Err(wait) => {
                        prop_assert!(wait > Duration::ZERO);
                        prop_assert!(wait <= window);
                    }
                }
            }

            for (i, start) in admitted.iter().enumerate() {
                let in_window = admitted[i..]
                    .iter()
                    .take_while(|t| t.duration_since(*start) < window)
                    .count();
                prop_assert!(in_window <= limit);
            }
        }
    }
}

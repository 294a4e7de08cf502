//! In-process provider with scripted outcomes.
//!
//! Used by the test-suite and by the `simulated` provider kind, which lets a
//! deployment exercise routing, rate limiting and fallback without spending
//! money on a real vendor.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

use super::{ProviderError, ProviderGateway};
use crate::types::{GenerationRequest, GenerationResponse, ProviderId};

/// Record of a call made to the mock provider.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub prompt: String,
    pub started_at: Instant,
}

/// Scriptable [`ProviderGateway`].
///
/// Outcomes queued with [`push_error`](Self::push_error) and
/// [`push_success`](Self::push_success) are consumed in FIFO order. Once the
/// script is empty the provider falls back to its configured behaviour: the
/// sticky error from [`always_failing`](Self::always_failing) if set,
/// otherwise random failures at `failure_rate`, otherwise success.
pub struct MockProvider {
    id: ProviderId,
    script: Mutex<VecDeque<Result<(), ProviderError>>>,
    sticky_error: Mutex<Option<ProviderError>>,
    failure_rate: f64,
    latency: Duration,
    cost_per_image: f64,
    credits: Mutex<Option<f64>>,
    supported_sizes: Vec<(u32, u32)>,
    max_batch_size: u32,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockProvider {
    pub fn new(id: impl Into<ProviderId>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(VecDeque::new()),
            sticky_error: Mutex::new(None),
            failure_rate: 0.0,
            latency: Duration::ZERO,
            cost_per_image: 0.02,
            credits: Mutex::new(None),
            supported_sizes: Vec::new(),
            max_batch_size: 4,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_cost(mut self, cost_per_image: f64) -> Self {
        self.cost_per_image = cost_per_image;
        self
    }

    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_credits(self, credits: f64) -> Self {
        *self.credits.lock() = Some(credits);
        self
    }

    pub fn with_supported_sizes(mut self, sizes: Vec<(u32, u32)>) -> Self {
        self.supported_sizes = sizes;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: u32) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Fail every unscripted call with `error`.
    pub fn always_failing(self, error: ProviderError) -> Self {
        *self.sticky_error.lock() = Some(error);
        self
    }

    pub fn push_error(&self, error: ProviderError) {
        self.script.lock().push_back(Err(error));
    }

    pub fn push_success(&self) {
        self.script.lock().push_back(Ok(()));
    }

    /// Clear the sticky error so unscripted calls succeed again.
    pub fn recover(&self) {
        *self.sticky_error.lock() = None;
    }

    pub fn set_credits(&self, credits: Option<f64>) {
        *self.credits.lock() = credits;
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent calls observed so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Result<(), ProviderError> {
        if let Some(outcome) = self.script.lock().pop_front() {
            return outcome;
        }
        if let Some(error) = self.sticky_error.lock().clone() {
            return Err(error);
        }
        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            return Err(ProviderError::failed("simulated failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderGateway for MockProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        self.calls.lock().push(MockCall {
            prompt: request.prompt.clone(),
            started_at: Instant::now(),
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = scopeguard::guard((), |_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.next_outcome()?;

        let images = (0..request.num_images)
            .map(|i| format!("{}:{}:{}", self.id, request.prompt, i).into_bytes())
            .collect();
        let mut metadata = BTreeMap::new();
        if let Some(seed) = request.seed {
            metadata.insert("seed".to_string(), serde_json::json!(seed));
        }

        Ok(GenerationResponse {
            images,
            image_urls: Vec::new(),
            cost: self.estimate_cost(request),
            generation_time: self.latency,
            provider: self.id.clone(),
            metadata,
        })
    }

    fn estimate_cost(&self, request: &GenerationRequest) -> f64 {
        self.cost_per_image * f64::from(request.num_images)
    }

    async fn remaining_credits(&self) -> Result<Option<f64>, ProviderError> {
        Ok(*self.credits.lock())
    }

    fn supported_sizes(&self) -> Vec<(u32, u32)> {
        self.supported_sizes.clone()
    }

    fn max_batch_size(&self) -> u32 {
        self.max_batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes_fifo() {
        let mock = MockProvider::new("mock");
        mock.push_error(ProviderError::rate_limited("first"));
        mock.push_success();

        let request = GenerationRequest::new("a red bicycle");
        assert!(matches!(
            mock.generate(&request).await,
            Err(ProviderError::RateLimited { .. })
        ));
        let response = mock.generate(&request).await.unwrap();
        assert_eq!(response.provider, ProviderId::from("mock"));
        assert_eq!(response.images.len(), 1);

        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.get_calls()[0].prompt, "a red bicycle");
    }

    #[tokio::test]
    async fn test_sticky_error_and_recover() {
        let mock = MockProvider::new("mock").always_failing(ProviderError::failed("down"));
        let request = GenerationRequest::new("x");

        assert!(mock.generate(&request).await.is_err());
        assert!(mock.generate(&request).await.is_err());

        mock.recover();
        assert!(mock.generate(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_cost_scales_with_image_count() {
        let mock = MockProvider::new("mock").with_cost(0.04);
        let request = GenerationRequest::new("x").with_num_images(3);

        let response = mock.generate(&request).await.unwrap();
        assert!((response.cost - 0.12).abs() < 1e-9);
        assert_eq!(response.image_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_tracking() {
        let mock = std::sync::Arc::new(MockProvider::new("mock").with_latency(Duration::from_secs(1)));
        let request = GenerationRequest::new("x");

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let mock = mock.clone();
                let request = request.clone();
                tokio::spawn(async move { mock.generate(&request).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mock.in_flight_count(), 3);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(mock.in_flight_count(), 0);
        assert_eq!(mock.peak_in_flight(), 3);
    }
}

//! Provider capability interface.
//!
//! The engine never talks to a vendor API directly: every provider sits behind
//! [`ProviderGateway`], which keeps the processor testable with
//! [`MockProvider`] and lets deployments plug in HTTP adapters such as
//! [`OpenAiImagesProvider`].

pub mod mock;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{GenerationRequest, GenerationResponse};

pub use mock::MockProvider;
pub use openai::OpenAiImagesProvider;

/// Shared handle to a provider implementation.
pub type SharedGateway = Arc<dyn ProviderGateway>;

/// Errors a provider call can fail with.
///
/// The variant decides the retry path: rate limits back off on the same
/// provider, credit exhaustion and unsupported requests move on to another
/// provider, everything else is retried and eventually falls back.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Insufficient credits: {0}")]
    InsufficientCredits(String),

    #[error("Unsupported request: {0}")]
    Unsupported(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Provider error: {0}")]
    Failed(String),
}

impl ProviderError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Unauthorized(_) => ErrorCategory::Authentication,
            Self::InsufficientCredits(_) => ErrorCategory::InsufficientCredits,
            Self::Unsupported(_) | Self::Failed(_) => ErrorCategory::Other,
        }
    }
}

/// Coarse error grouping used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Timeout,
    Authentication,
    InsufficientCredits,
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::InsufficientCredits => "insufficient_credits",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability interface every provider adapter implements.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Run one generation call.
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError>;

    /// Expected cost in dollars of running `request`.
    fn estimate_cost(&self, request: &GenerationRequest) -> f64;

    /// Remaining account balance, or `None` when the provider does not expose one.
    async fn remaining_credits(&self) -> Result<Option<f64>, ProviderError>;

    /// Supported `(width, height)` pairs. Empty means any size.
    fn supported_sizes(&self) -> Vec<(u32, u32)>;

    /// Maximum number of images per call.
    fn max_batch_size(&self) -> u32;

    /// Check that this provider can serve `request` at all.
    fn validate(&self, request: &GenerationRequest) -> Result<(), ProviderError> {
        let sizes = self.supported_sizes();
        if !sizes.is_empty() && !sizes.contains(&(request.width, request.height)) {
            return Err(ProviderError::Unsupported(format!(
                "size {}x{} not supported",
                request.width, request.height
            )));
        }
        if request.num_images > self.max_batch_size() {
            return Err(ProviderError::Unsupported(format!(
                "{} images requested, at most {} per call",
                request.num_images,
                self.max_batch_size()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ProviderError::rate_limited("slow down").category(),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            ProviderError::Timeout(Duration::from_secs(1)).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            ProviderError::Unauthorized("bad key".into()).category(),
            ErrorCategory::Authentication
        );
        assert_eq!(
            ProviderError::InsufficientCredits("empty".into()).category(),
            ErrorCategory::InsufficientCredits
        );
        assert_eq!(ProviderError::failed("boom").category(), ErrorCategory::Other);
    }

    #[test]
    fn test_default_validation() {
        let provider = MockProvider::new("mock").with_supported_sizes(vec![(512, 512)]);

        let ok = GenerationRequest::new("a fox").with_size(512, 512);
        assert!(provider.validate(&ok).is_ok());

        let wrong_size = GenerationRequest::new("a fox");
        assert!(matches!(
            provider.validate(&wrong_size),
            Err(ProviderError::Unsupported(_))
        ));

        let too_many = GenerationRequest::new("a fox")
            .with_size(512, 512)
            .with_num_images(5);
        assert!(matches!(
            provider.validate(&too_many),
            Err(ProviderError::Unsupported(_))
        ));
    }
}

//! Adapter for OpenAI-compatible `/v1/images/generations` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tokio::time::Instant;

use super::{ProviderError, ProviderGateway};
use crate::types::{GenerationRequest, GenerationResponse, ProviderId};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// HTTP adapter for the OpenAI images API and servers that mimic it.
#[derive(Clone)]
pub struct OpenAiImagesProvider {
    id: ProviderId,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    b64_json: Option<String>,
    url: Option<String>,
    revised_prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    code: Option<String>,
}

impl OpenAiImagesProvider {
    pub fn new(
        id: impl Into<ProviderId>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn price_per_image(&self, width: u32, height: u32) -> f64 {
        match (self.model.as_str(), width, height) {
            ("dall-e-3", 1024, 1024) => 0.040,
            ("dall-e-3", _, _) => 0.080,
            (_, 256, 256) => 0.016,
            (_, 512, 512) => 0.018,
            _ => 0.020,
        }
    }

    fn map_error_status(
        &self,
        status: reqwest::StatusCode,
        retry_after: Option<Duration>,
        body: &str,
    ) -> ProviderError {
        let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
        let message = if envelope.error.message.is_empty() {
            body.chars().take(200).collect()
        } else {
            envelope.error.message
        };
        let out_of_credit = matches!(
            envelope.error.code.as_deref(),
            Some("insufficient_quota") | Some("billing_hard_limit_reached")
        );

        match status.as_u16() {
            _ if out_of_credit => ProviderError::InsufficientCredits(message),
            402 => ProviderError::InsufficientCredits(message),
            429 => ProviderError::RateLimited {
                message,
                retry_after,
            },
            401 | 403 => ProviderError::Unauthorized(message),
            code => ProviderError::Failed(format!("HTTP {code}: {message}")),
        }
    }
}

#[async_trait]
impl ProviderGateway for OpenAiImagesProvider {
    #[tracing::instrument(skip(self, request), fields(provider_id = %self.id, model = %self.model))]
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let url = format!("{}/v1/images/generations", self.base_url);
        let payload = serde_json::json!({
            "model": self.model,
            "prompt": request.prompt,
            "n": request.num_images,
            "size": format!("{}x{}", request.width, request.height),
            "response_format": "b64_json",
        });

        tracing::debug!(url = %url, "Sending image generation request");
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Failed(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let error = self.map_error_status(status, retry_after, &body);
            tracing::warn!(status = status.as_u16(), error = %error, "Image generation rejected");
            return Err(error);
        }

        let body: ImagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Failed(format!("invalid response body: {e}")))?;

        let mut images = Vec::new();
        let mut image_urls = Vec::new();
        let mut revised_prompts = Vec::new();
        for item in body.data {
            if let Some(encoded) = item.b64_json {
                images.push(
                    STANDARD
                        .decode(encoded)
                        .map_err(|e| ProviderError::Failed(format!("invalid image data: {e}")))?,
                );
            }
            if let Some(url) = item.url {
                image_urls.push(url);
            }
            if let Some(prompt) = item.revised_prompt {
                revised_prompts.push(prompt);
            }
        }

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("model".to_string(), serde_json::json!(self.model));
        if !revised_prompts.is_empty() {
            metadata.insert(
                "revised_prompts".to_string(),
                serde_json::json!(revised_prompts),
            );
        }

        Ok(GenerationResponse {
            images,
            image_urls,
            cost: self.estimate_cost(request),
            generation_time: started.elapsed(),
            provider: self.id.clone(),
            metadata,
        })
    }

    fn estimate_cost(&self, request: &GenerationRequest) -> f64 {
        self.price_per_image(request.width, request.height) * f64::from(request.num_images)
    }

    async fn remaining_credits(&self) -> Result<Option<f64>, ProviderError> {
        // The images API exposes no balance endpoint.
        Ok(None)
    }

    fn supported_sizes(&self) -> Vec<(u32, u32)> {
        if self.model == "dall-e-3" {
            vec![(1024, 1024), (1024, 1792), (1792, 1024)]
        } else {
            vec![(256, 256), (512, 512), (1024, 1024)]
        }
    }

    fn max_batch_size(&self) -> u32 {
        if self.model == "dall-e-3" { 1 } else { 10 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> OpenAiImagesProvider {
        OpenAiImagesProvider::new("openai", server.uri(), "sk-test", "dall-e-2")
    }

    #[tokio::test]
    async fn test_generate_decodes_images() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "dall-e-2",
                "n": 1,
                "size": "512x512",
                "response_format": "b64_json"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "created": 1700000000,
                "data": [{"b64_json": "aGVsbG8="}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = GenerationRequest::new("a harbour").with_size(512, 512);
        let response = provider(&server).generate(&request).await.unwrap();

        assert_eq!(response.images, vec![b"hello".to_vec()]);
        assert_eq!(response.provider, ProviderId::from("openai"));
        assert!((response.cost - 0.018).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_json(serde_json::json!({
                        "error": {"message": "Rate limit reached", "code": "rate_limit_exceeded"}
                    })),
            )
            .mount(&server)
            .await;

        let err = provider(&server)
            .generate(&GenerationRequest::new("x"))
            .await
            .unwrap_err();

        match err {
            ProviderError::RateLimited {
                message,
                retry_after,
            } => {
                assert_eq!(message, "Rate limit reached");
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quota_errors_map_to_insufficient_credits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "You exceeded your current quota", "code": "insufficient_quota"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .generate(&GenerationRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InsufficientCredits(_)));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let request = GenerationRequest::new("x");

        assert!(matches!(
            provider.generate(&request).await,
            Err(ProviderError::Unauthorized(_))
        ));
        match provider.generate(&request).await {
            Err(ProviderError::Failed(message)) => assert!(message.contains("HTTP 500")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let provider = provider(&server).with_timeout(Duration::from_millis(100));
        let err = provider
            .generate(&GenerationRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }

    #[test]
    fn test_pricing_and_limits() {
        let dalle2 = OpenAiImagesProvider::new("openai", "http://localhost", "k", "dall-e-2");
        let dalle3 = OpenAiImagesProvider::new("openai", "http://localhost", "k", "dall-e-3");

        let small = GenerationRequest::new("x").with_size(256, 256).with_num_images(2);
        assert!((dalle2.estimate_cost(&small) - 0.032).abs() < 1e-9);
        assert!((dalle3.estimate_cost(&GenerationRequest::new("x")) - 0.040).abs() < 1e-9);

        assert_eq!(dalle2.max_batch_size(), 10);
        assert_eq!(dalle3.max_batch_size(), 1);
        assert!(dalle3.validate(&small).is_err());
    }
}

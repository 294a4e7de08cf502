//! Request and response types shared by providers, the cache and the processor.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier of a configured provider, e.g. `"openai"` or `"stability"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single image-generation request.
///
/// Requests are immutable once submitted. Missing fields take the usual
/// defaults: a 1024x1024 image, one image per call, guidance 7.5, 30 steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub num_images: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub guidance_scale: f64,
    pub steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Provider-specific parameters passed through untouched
    pub extra_params: BTreeMap<String, serde_json::Value>,
    /// Notification target for callers; never affects generated output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: None,
            width: 1024,
            height: 1024,
            num_images: 1,
            seed: None,
            guidance_scale: 7.5,
            steps: 30,
            style: None,
            extra_params: BTreeMap::new(),
            webhook_url: None,
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_num_images(mut self, num_images: u32) -> Self {
        self.num_images = num_images;
        self
    }

    /// Provider-independent sanity checks, run at submission.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(Error::InvalidRequest("prompt must not be empty".to_string()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidRequest(format!(
                "invalid dimensions {}x{}",
                self.width, self.height
            )));
        }
        if self.num_images == 0 {
            return Err(Error::InvalidRequest(
                "num_images must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of one successful provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Raw image bytes, serialized as base64 strings
    #[serde(default, with = "base64_images")]
    pub images: Vec<Vec<u8>>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Realized cost in dollars
    pub cost: f64,
    #[serde(with = "humantime_serde")]
    pub generation_time: Duration,
    pub provider: ProviderId,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl GenerationResponse {
    /// Number of images carried, either inline or by URL.
    pub fn image_count(&self) -> usize {
        self.images.len().max(self.image_urls.len())
    }
}

mod base64_images {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(images: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(images.iter().map(|image| STANDARD.encode(image)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_apply_to_sparse_json() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "a lighthouse at dusk", "seed": 7}"#).unwrap();

        assert_eq!(request.width, 1024);
        assert_eq!(request.height, 1024);
        assert_eq!(request.num_images, 1);
        assert_eq!(request.steps, 30);
        assert_eq!(request.seed, Some(7));
        assert!(request.webhook_url.is_none());
    }

    #[test]
    fn test_request_validation() {
        assert!(GenerationRequest::new("a cat").validate().is_ok());
        assert!(matches!(
            GenerationRequest::new("   ").validate(),
            Err(Error::InvalidRequest(_))
        ));
        assert!(
            GenerationRequest::new("a cat")
                .with_size(0, 512)
                .validate()
                .is_err()
        );
        assert!(
            GenerationRequest::new("a cat")
                .with_num_images(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_response_images_serialize_as_base64() {
        let response = GenerationResponse {
            images: vec![vec![0xde, 0xad, 0xbe, 0xef]],
            image_urls: vec![],
            cost: 0.02,
            generation_time: Duration::from_millis(1500),
            provider: ProviderId::from("openai"),
            metadata: BTreeMap::new(),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["images"][0], "3q2+7w==");
        assert_eq!(json["generation_time"], "1s 500ms");

        let back: GenerationResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }
}

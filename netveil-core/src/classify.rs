//! Response content kinds and the external image classifier

use crate::error::ApiError;
use async_trait::async_trait;
use bytes::Bytes;
use netveil_proxy::config::PolicyStore;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(10);

/// Response bodies the filter inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Json,
    Text,
    Image,
}

impl ContentKind {
    /// Classify a lowercased `Content-Type` essence; other types are not inspected
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            "text/html" | "application/xhtml+xml" => Some(Self::Html),
            "application/json" | "text/json" => Some(Self::Json),
            ct if ct.starts_with("application/") && ct.ends_with("+json") => Some(Self::Json),
            "text/plain" => Some(Self::Text),
            "image/svg+xml" => None,
            ct if ct.starts_with("image/") => Some(Self::Image),
            _ => None,
        }
    }

    pub fn is_text(self) -> bool {
        !matches!(self, Self::Image)
    }
}

#[async_trait]
pub trait ImageClassifier: Send + Sync {
    async fn is_objectionable(&self, image: &Bytes, content_type: &str) -> Result<bool, ApiError>;
}

#[derive(Debug, Deserialize)]
struct Classification {
    objectionable: bool,
}

/// Posts images to the classifier endpoint named in the current policy.
/// Without an endpoint every image passes.
pub struct HttpImageClassifier {
    client: Client,
    policy: Arc<PolicyStore>,
}

impl HttpImageClassifier {
    pub fn new(policy: Arc<PolicyStore>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(CLASSIFIER_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self { client, policy })
    }
}

#[async_trait]
impl ImageClassifier for HttpImageClassifier {
    async fn is_objectionable(&self, image: &Bytes, content_type: &str) -> Result<bool, ApiError> {
        let Some(endpoint) = self
            .policy
            .snapshot()
            .and_then(|p| p.config.content.image_classifier_url.clone())
        else {
            return Ok(false);
        };

        let response = self
            .client
            .post(&endpoint)
            .header(CONTENT_TYPE, content_type)
            .body(image.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let result: Classification = response.json().await?;
        debug!("Image classified, objectionable: {}", result.objectionable);
        Ok(result.objectionable)
    }
}

//! Client for the remote management API

use crate::accountability::BlockEvent;
use crate::auth::AuthenticationStorage;
use crate::error::ApiError;
use crate::time::TamperEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Bypass grant or status as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassResponse {
    pub allowed: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub used: u32,
    #[serde(default)]
    pub permitted: u32,
}

/// User request to have a block decision reviewed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerTime {
    time: DateTime<Utc>,
}

/// Operations the service needs from the management server
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn server_time(&self) -> Result<DateTime<Utc>, ApiError>;

    /// Ask for a relaxed policy; `NotFound` means the server does not track
    /// bypasses and counting is local
    async fn request_bypass(&self) -> Result<BypassResponse, ApiError>;

    async fn bypass_status(&self) -> Result<BypassResponse, ApiError>;

    async fn notify_block(&self, event: &BlockEvent) -> Result<(), ApiError>;

    async fn report_tampering(&self, event: &TamperEvent) -> Result<(), ApiError>;

    async fn request_review(&self, review: &ReviewRequest) -> Result<(), ApiError>;

    /// Follow the management server named by a newly loaded policy
    fn configure(&self, _base_url: Option<&str>) -> Result<(), ApiError> {
        Ok(())
    }
}

/// JSON-over-HTTPS implementation of [`RemoteApi`]
pub struct HttpRemoteApi {
    client: Client,
    base_url: RwLock<Option<Url>>,
    auth: Arc<AuthenticationStorage>,
}

impl HttpRemoteApi {
    pub fn new(auth: Arc<AuthenticationStorage>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .user_agent(concat!("netveil/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: RwLock::new(None),
            auth,
        })
    }

    /// Point the client at a management server; `None` disables every call
    pub fn set_base_url(&self, base: Option<&str>) -> Result<(), ApiError> {
        let parsed = match base {
            Some(raw) => {
                // Url::join replaces the last segment unless the base ends in '/'
                let normalized = if raw.ends_with('/') {
                    raw.to_string()
                } else {
                    format!("{raw}/")
                };
                Some(Url::parse(&normalized).map_err(|e| ApiError::Decode(e.to_string()))?)
            }
            None => None,
        };
        match self.base_url.write() {
            Ok(mut guard) => *guard = parsed,
            Err(poisoned) => *poisoned.into_inner() = parsed,
        }
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let base = match self.base_url.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let base = base.ok_or(ApiError::NotConfigured)?;
        base.join(path).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn send<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<reqwest::Response, ApiError>
    where
        B: Serialize + ?Sized + Sync,
    {
        let url = self.endpoint(path)?;
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, url);
        if let Some(token) = self.auth.token() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED => {
                self.auth.require_reauthentication();
                Err(ApiError::Unauthorized)
            }
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            status if status.is_success() => Ok(response),
            status => Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    fn configure(&self, base_url: Option<&str>) -> Result<(), ApiError> {
        self.set_base_url(base_url)
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ApiError> {
        let response = self.send::<()>(Method::GET, "time", None).await?;
        let body: ServerTime = response.json().await?;
        Ok(body.time)
    }

    async fn request_bypass(&self) -> Result<BypassResponse, ApiError> {
        let response = self.send::<()>(Method::POST, "bypass", None).await?;
        Ok(response.json().await?)
    }

    async fn bypass_status(&self) -> Result<BypassResponse, ApiError> {
        let response = self.send::<()>(Method::GET, "bypass", None).await?;
        Ok(response.json().await?)
    }

    async fn notify_block(&self, event: &BlockEvent) -> Result<(), ApiError> {
        self.send(Method::POST, "accountability", Some(event)).await?;
        Ok(())
    }

    async fn report_tampering(&self, event: &TamperEvent) -> Result<(), ApiError> {
        self.send(Method::POST, "tampering", Some(event)).await?;
        Ok(())
    }

    async fn request_review(&self, review: &ReviewRequest) -> Result<(), ApiError> {
        self.send(Method::POST, "review", Some(review)).await?;
        Ok(())
    }
}

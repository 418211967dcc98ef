//! API client for the scheduler's control surface

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use scheduler_lib::toggle::ToggleOutcome;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// Non-success response from the scheduler
#[derive(Debug, thiserror::Error)]
#[error("API error ({status}): {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        Self { status, message }
    }
}

/// HTTP client for the scheduler API
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// GET a plain-text endpoint
    pub async fn get_text(&self, path: &str) -> Result<String> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await.into());
        }

        response.text().await.context("Failed to read response")
    }

    /// POST a JSON body and decode the JSON response
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await.into());
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn scale_down(&self, namespace: &str, name: &str) -> Result<ScaleResponse> {
        self.post("scaleDown", &ScaleRequest::new(namespace, name))
            .await
    }

    pub async fn scale_up(&self, namespace: &str, name: &str) -> Result<ScaleResponse> {
        self.post("scaleUp", &ScaleRequest::new(namespace, name)).await
    }

    pub async fn version(&self) -> Result<String> {
        Ok(self.get_text("version").await?.trim().to_string())
    }
}

// API request/response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub namespace: String,
    pub name: String,
}

impl ScaleRequest {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleResponse {
    pub namespace: String,
    pub name: String,
    pub action: String,
    pub outcome: ToggleOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

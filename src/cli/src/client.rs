//! HTTP client for communicating with the Sutra API server.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Header the server reads the API key from.
const API_KEY_HEADER: &str = "x-api-key";

/// API response wrapper matching the server's ApiResponse format.
#[derive(Debug, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
}

/// Error envelope returned by the server on rejection.
#[derive(Debug, serde::Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// HTTP client for the Sutra API.
pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    /// GET a wrapped resource and return its `data`.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        unwrap_data(check(resp).await?, &url).await
    }

    /// POST without a body and return the wrapped `data`.
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .authed(self.client.post(&url))
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        unwrap_data(check(resp).await?, &url).await
    }

    /// POST a JSON body and deserialize the unwrapped response.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .authed(self.client.post(&url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        check(resp)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    /// Perform a raw GET request and return the full JSON value (for health endpoint).
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        check(resp)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}

/// Turn a non-2xx response into an error carrying the server's message.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = resp.text().await.unwrap_or_default();

    let mut message = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => format!("{} ({}): {}", status, envelope.error.code, envelope.error.message),
        Err(_) => format!("{}: {}", status, body),
    };
    if let Some(secs) = retry_after {
        message.push_str(&format!(", retry after {}s", secs));
    }
    anyhow::bail!("API error {}", message)
}

async fn unwrap_data<T: DeserializeOwned>(resp: Response, url: &str) -> Result<T> {
    let api_resp: ApiResponse<T> = resp
        .json()
        .await
        .with_context(|| format!("Failed to parse response from {}", url))?;

    if api_resp.success {
        api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("API returned success but no data"))
    } else {
        Err(anyhow::anyhow!("API reported failure for {}", url))
    }
}

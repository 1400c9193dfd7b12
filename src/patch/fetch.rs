//! Patch payload download.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

#[async_trait]
pub trait PatchFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Shared HTTP client for the manifest and patch downloads
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| BridgeError::Config(format!("HTTP client: {}", e)))
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PatchFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let error = |e: reqwest::Error| BridgeError::PatchFetch {
            url: url.to_string(),
            message: e.to_string(),
        };

        debug!("GET {}", url);
        let body = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(error)?
            .bytes()
            .await
            .map_err(error)?;
        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body)
    }
}

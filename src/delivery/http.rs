//! HTTP ingestion transport.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::transport::{BatchResponse, IngestBatch, IngestTransport};
use crate::config::DeliveryConfig;
use crate::error::TransportError;

/// Posts batches as JSON to `{endpoint_url}/events`.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    api_token: Option<String>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .field("authenticated", &self.api_token.is_some())
            .finish()
    }
}

impl HttpTransport {
    /// Builds the transport. The bearer token, if any, is read from the
    /// environment variable named by `api_token_env`.
    pub fn new(config: &DeliveryConfig) -> Result<Self, TransportError> {
        let api_token = std::env::var(&config.api_token_env)
            .ok()
            .filter(|token| !token.is_empty());
        Self::with_token(config, api_token)
    }

    pub fn with_token(config: &DeliveryConfig, api_token: Option<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TransportError::Network(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}/events", config.endpoint_url.trim_end_matches('/')),
            api_token,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IngestTransport for HttpTransport {
    async fn send_batch(&self, batch: &IngestBatch) -> Result<BatchResponse, TransportError> {
        let mut request = self.client.post(&self.url).json(batch);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(format!("HTTP error: {e}"))
            }
        })?;

        let status = resp.status();
        debug!("Ingestion endpoint answered {} for {} events", status, batch.events.len());
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        resp.json::<BatchResponse>().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::InvalidResponse(e.to_string())
            }
        })
    }
}

//! Liveness probing of the TGIS HTTP side channel

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Errors from a single health probe
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Nothing accepts connections on the health port yet
    #[error("health endpoint not listening: {0}")]
    NotListening(String),

    /// The request failed for any other reason (timeout, reset, bad URL)
    #[error("health request failed: {0}")]
    Request(String),
}

impl ProbeError {
    /// Connection refused is expected while the server is still booting
    pub fn is_not_listening(&self) -> bool {
        matches!(self, ProbeError::NotListening(_))
    }
}

/// A bounded-timeout liveness check
///
/// `Ok(true)` means healthy. `Ok(false)` means the endpoint answered with
/// something other than 200.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> std::result::Result<bool, ProbeError>;
}

/// Probe that issues `GET /health` against the local HTTP port
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: Client,
    url: Url,
}

impl HttpHealthProbe {
    /// Probe `http://localhost:{http_port}/health`
    pub fn new(http_port: u16, timeout: Duration) -> std::result::Result<Self, ProbeError> {
        Self::with_host("localhost", http_port, timeout)
    }

    /// Probe `/health` on an explicit host
    pub fn with_host(
        host: &str,
        http_port: u16,
        timeout: Duration,
    ) -> std::result::Result<Self, ProbeError> {
        let url = Url::parse(&format!("http://{}:{}/health", host, http_port))
            .map_err(|e| ProbeError::Request(format!("invalid health URL: {}", e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Request(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, url })
    }

    /// URL the probe hits
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> std::result::Result<bool, ProbeError> {
        match self.client.get(self.url.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                if status != StatusCode::OK {
                    debug!(url = %self.url, status = %status, "Health check returned non-200");
                }
                Ok(status == StatusCode::OK)
            }
            Err(e) if e.is_connect() => Err(ProbeError::NotListening(e.to_string())),
            Err(e) => Err(ProbeError::Request(e.to_string())),
        }
    }
}

//! Upstream spectator endpoint client

use std::future::Future;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::{Result, SpectrecError};

/// Number of attempts before a fetch is given up on
const FETCH_ATTEMPTS: usize = 3;

/// Pause between failed fetch attempts
const RETRY_WAIT: Duration = Duration::from_secs(5);

/// A fetcher for the upstream spectator endpoint.
///
/// Implementations return the response body on HTTP 200 and the
/// [`SpectrecError::NotFound`] sentinel on 404 without retrying. Any
/// other failure is retried before the last error is surfaced.
pub trait SpectatorApi: Send + Sync {
    /// Fetch the body bytes behind `url`.
    fn fetch_bytes(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Production [`SpectatorApi`] backed by a pooled HTTP client.
pub struct UpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl UpstreamClient {
    /// Create a new upstream client.
    #[must_use]
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build_http();

        Self { client }
    }

    /// Perform a single GET without retrying.
    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>> {
        let uri = url
            .parse::<Uri>()
            .map_err(|e| SpectrecError::Other(format!("invalid URL '{url}': {e}")))?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| SpectrecError::Other(format!("failed to build request: {e}")))?;

        debug!("fetching {}", url);

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| SpectrecError::Other(format!("request failed: {e}")))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(SpectrecError::NotFound),
            status => return Err(SpectrecError::Other(status.to_string())),
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SpectrecError::Other(format!("failed to read response body: {e}")))?
            .to_bytes();

        Ok(body.to_vec())
    }
}

impl SpectatorApi for UpstreamClient {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let mut last_error = SpectrecError::Other("request failed".to_string());

        for _ in 0..FETCH_ATTEMPTS {
            match self.fetch_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(SpectrecError::NotFound) => return Err(SpectrecError::NotFound),
                Err(e) => {
                    warn!("fetch of {} failed, retrying: {}", url, e);
                    last_error = e;
                    tokio::time::sleep(RETRY_WAIT).await;
                }
            }
        }

        Err(last_error.with_op("request URL"))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_client_creation() {
        let client = UpstreamClient::new();
        assert!(std::mem::size_of_val(&client) > 0);
    }
}

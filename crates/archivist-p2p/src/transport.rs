use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("response from {url} is not signed by {expected}")]
    BadSignature { url: String, expected: String },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

/// JSON-over-HTTP calls to peers. The only seam between the archiver and
/// the network for request/response traffic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn get_json(&self, url: &str, timeout: Duration) -> Result<Value, TransportError>;

    async fn post_json(&self, url: &str, body: Value, timeout: Duration) -> Result<Value, TransportError>;
}

/// [`PeerTransport`] over a shared reqwest client.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_err(url: &str, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(url.to_string())
        } else if err.is_decode() {
            TransportError::Decode {
                url: url.to_string(),
                reason: err.to_string(),
            }
        } else {
            TransportError::Request {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }

    async fn finish(url: &str, response: reqwest::Response) -> Result<Value, TransportError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| Self::map_err(url, e))
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn get_json(&self, url: &str, timeout: Duration) -> Result<Value, TransportError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_err(url, e))?;
        Self::finish(url, response).await
    }

    async fn post_json(&self, url: &str, body: Value, timeout: Duration) -> Result<Value, TransportError> {
        debug!("POST {}", url);
        let response = self
            .client
            .post(url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_err(url, e))?;
        Self::finish(url, response).await
    }
}

//! Transport client.
//!
//! Executes one HTTP exchange per call to [`Transport::send`]. The engine owns
//! retries and interpretation; the transport only moves bytes.

use crate::translate::Verb;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("verb {0} cannot be sent")]
    InvalidVerb(Verb),
}

/// A received response, whatever its status.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Final URL after redirects, when the transport knows it.
    pub url: Option<String>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        verb: Verb,
        url: &Url,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<RawResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            request_timeout_ms: 30000,
            user_agent: format!("restfs/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// reqwest-backed transport. Cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() {
        TransportError::Body(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        verb: Verb,
        url: &Url,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<RawResponse, TransportError> {
        let method = reqwest::Method::from_bytes(verb.as_str().as_bytes())
            .map_err(|_| TransportError::InvalidVerb(verb))?;
        let mut builder = self
            .client
            .request(method, url.clone())
            .headers(headers.clone());
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;

        tracing::trace!("{} {} -> {} ({} bytes)", verb, url, status, body.len());

        Ok(RawResponse {
            status,
            headers,
            body,
            url: Some(final_url),
        })
    }
}

//! Raw request/response boundary with the carrier.
//!
//! Everything above this layer works with [`OutboundRequest`] and
//! [`RawResponse`]; only [`ReqwestTransport`] knows about sockets. Tests swap
//! in a scripted transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::instrument;

/// A request to the carrier, relative to the configured base URL.
///
/// Implements `Debug` manually: token request bodies carry the client secret.
#[derive(Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path starting with `/`, e.g. `/api/v2/me/balance`.
    pub path: String,
    /// Access token to send as `Authorization: Bearer`.
    pub bearer: Option<SecretString>,
    pub body: Option<serde_json::Value>,
}

impl OutboundRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            bearer: None,
            body: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_bearer(mut self, token: SecretString) -> Self {
        self.bearer = Some(token);
        self
    }
}

impl std::fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .field("body", &self.body.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// A response as received, before classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    /// Parsed `Retry-After` header (delta-seconds form only).
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl RawResponse {
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// The request never produced an HTTP status.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The per-request timeout elapsed.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection refused, reset or dropped mid-response.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The request could not be built or sent for a non-network reason.
    #[error("request error: {0}")]
    Request(String),
}

impl TransportError {
    /// Whether trying again may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::Connection(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Sends one request and returns whatever came back.
///
/// Implementations do not retry or interpret status codes.
#[async_trait]
pub trait CarrierTransport: Send + Sync {
    async fn execute(&self, request: OutboundRequest) -> Result<RawResponse, TransportError>;
}

/// Production transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl ReqwestTransport {
    /// Build a transport with the given per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `reqwest::Error` if the TLS backend cannot be initialized.
    pub fn new(
        base_url: &url::Url,
        timeout: Duration,
        user_agent: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;

        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            user_agent: user_agent.into(),
        })
    }
}

#[async_trait]
impl CarrierTransport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn execute(&self, request: OutboundRequest) -> Result<RawResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = self
            .client
            .request(request.method, url)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, &self.user_agent);

        if let Some(token) = &request.bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await?;

        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn normalize_base_url(base_url: &url::Url) -> String {
    base_url.as_str().trim_end_matches('/').to_owned()
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

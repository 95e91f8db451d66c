//! HTTP transport with byte caps and cooperative cancellation.
//!
//! The engine never talks to `reqwest` directly; it goes through the
//! [`Transport`] trait so tests can substitute a scripted implementation.
//! [`HttpTransport`] classifies status codes the way the backend expects:
//! 401 means bad credentials, other 4xx is a proxy/malformed-request
//! problem, and 5xx is transient and worth retrying on the next poll.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::flow::FlowControlToken;

/// Transport error taxonomy.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Credentials were rejected by the backend.
    #[error("unauthorized - device credentials rejected")]
    Unauthorized,
    /// Request failed due to proxy or malformed input (4xx excluding 401).
    #[error("proxy error or malformed request: status {0}")]
    Proxy(u16),
    /// Backend reported a temporary outage (5xx).
    #[error("transient backend error: status {0}")]
    Retryable(u16),
    /// The provided URL violates the required transport policy.
    #[error("insecure base url requires explicit opt-in: {0}")]
    InsecureUrl(String),
    /// The response exceeded the caller's byte cap and was dropped unparsed.
    #[error("response for '{url}' exceeds the {limit} byte cap")]
    Oversize { url: String, limit: u64 },
    /// The flow-control token was aborted mid-transfer.
    #[error("transfer cancelled")]
    Cancelled,
    /// Transport-level issue (DNS, TLS, socket, etc.).
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    /// True when the failure is transient and a prompt retry is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable(_))
    }
}

/// Signed HTTP operations against the repositories and the device gateway.
pub trait Transport: Send + Sync {
    /// Fetches `url`, enforcing a hard byte cap.
    fn get(
        &self,
        url: &str,
        limit: u64,
        token: &FlowControlToken,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// PUTs a JSON document.
    fn put(
        &self,
        url: &str,
        body: &Value,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// POSTs a JSON document and returns the response body.
    fn post(
        &self,
        url: &str,
        body: &Value,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

/// Options governing how the HTTP transport is constructed.
#[derive(Debug, Clone, Default)]
pub struct HttpTransportOptions {
    /// Whether plaintext (HTTP) endpoints are allowed.
    pub allow_plaintext: bool,
    /// Whether TLS certificate validation should be skipped.
    pub accept_invalid_certs: bool,
    /// PEM-encoded TLS client identity (cert + key) when issued.
    pub client_identity_pem: Option<Vec<u8>>,
}

/// Production transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    allow_plaintext: bool,
}

impl HttpTransport {
    pub fn new(options: HttpTransportOptions) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.accept_invalid_certs);
        if let Some(pem) = &options.client_identity_pem {
            let identity = reqwest::Identity::from_pem(pem)?;
            builder = builder.identity(identity);
        }
        Ok(Self {
            client: builder.build()?,
            allow_plaintext: options.allow_plaintext,
        })
    }

    fn check_scheme(&self, url: &str) -> Result<(), TransportError> {
        if !self.allow_plaintext && url.starts_with("http://") {
            return Err(TransportError::InsecureUrl(url.to_string()));
        }
        Ok(())
    }
}

/// Maps an HTTP status to the transport error taxonomy.
fn classify_status(status: reqwest::StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        401 => Err(TransportError::Unauthorized),
        code @ 400..=499 => Err(TransportError::Proxy(code)),
        code => Err(TransportError::Retryable(code)),
    }
}

impl Transport for HttpTransport {
    async fn get(
        &self,
        url: &str,
        limit: u64,
        token: &FlowControlToken,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_scheme(url)?;
        if !token.can_continue() {
            return Err(TransportError::Cancelled);
        }
        let mut response = self.client.get(url).send().await?;
        classify_status(response.status())?;

        // Announced length lets us fail before pulling a single body byte.
        if let Some(announced) = response.content_length() {
            if announced > limit {
                return Err(TransportError::Oversize {
                    url: url.to_string(),
                    limit,
                });
            }
        }

        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if !token.can_continue() {
                return Err(TransportError::Cancelled);
            }
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(TransportError::Oversize {
                    url: url.to_string(),
                    limit,
                });
            }
            body.extend_from_slice(&chunk);
        }
        debug!(url, bytes = body.len(), "transport get complete");
        Ok(body)
    }

    async fn put(&self, url: &str, body: &Value) -> Result<(), TransportError> {
        self.check_scheme(url)?;
        let response = self.client.put(url).json(body).send().await?;
        classify_status(response.status())
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Vec<u8>, TransportError> {
        self.check_scheme(url)?;
        let response = self.client.post(url).json(body).send().await?;
        classify_status(response.status())?;
        Ok(response.bytes().await?.to_vec())
    }
}

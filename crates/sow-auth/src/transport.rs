//! Outbound HTTP transport used by the provider caches
//!
//! The caches only ever need "GET this URL and give me the body". The trait
//! keeps that seam narrow so tests can count and script upstream calls, while
//! production uses one pooled [`reqwest::Client`] shared by every cache.
//!
//! A [`TransportError`] always means the provider could not be reached (DNS,
//! connect, timeout, non-success status, oversized body). Parsing is the
//! caller's business and never produces a transport error.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::VerifierConfig;
use crate::error::ConfigError;

/// Largest discovery or JWKS body the transport will buffer (1 MiB)
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Network-layer failure talking to the identity provider
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection, TLS, or timeout failure
    #[error("request to {url} failed: {reason}")]
    Request {
        /// Target URL
        url: String,
        /// Underlying error text
        reason: String,
    },

    /// The provider answered with a non-success status
    #[error("{url} returned HTTP {status}")]
    Status {
        /// Target URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The response body exceeded the configured size limit
    #[error("{url} response exceeds {limit} bytes")]
    TooLarge {
        /// Target URL
        url: String,
        /// Limit in bytes
        limit: usize,
    },
}

/// Minimal GET transport toward the identity provider
#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// Fetch `url` and return the raw response body
    async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

/// Pooled reqwest-backed transport
///
/// Cloning is cheap and shares the connection pool. The pool is released when
/// the last clone is dropped, which in a service means once at shutdown.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    max_response_size: usize,
}

impl ReqwestTransport {
    /// Build a transport with the given per-call timeout
    ///
    /// Redirects are not followed: a discovery or JWKS endpoint that
    /// redirects is treated as unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::HttpClient`] if the TLS backend fails to initialize.
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("sow-auth/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::from_client(client))
    }

    /// Build a transport from the verifier configuration
    ///
    /// # Errors
    ///
    /// See [`ReqwestTransport::new`].
    pub fn from_config(config: &VerifierConfig) -> Result<Self, ConfigError> {
        Self::new(config.http_timeout)
    }

    /// Wrap an existing client
    pub fn from_client(client: reqwest::Client) -> Self {
        Self {
            client,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }

    /// Cap the size of a response body
    pub fn with_max_response_size(mut self, limit: usize) -> Self {
        self.max_response_size = limit;
        self
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        debug!(url = %url, "Fetching from identity provider");

        let mut response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let too_large = || TransportError::TooLarge {
            url: url.to_string(),
            limit: self.max_response_size,
        };

        if let Some(content_length) = response.content_length()
            && content_length > self.max_response_size as u64
        {
            return Err(too_large());
        }

        // Content-Length may be absent or wrong, so enforce the cap while reading.
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| TransportError::Request {
            url: url.to_string(),
            reason: format!("failed to read body: {e}"),
        })? {
            if body.len() + chunk.len() > self.max_response_size {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

//! Error taxonomy for token verification
//!
//! Every failure the verifier can produce maps to exactly one of three
//! externally visible outcomes: 401 with a generic message and a bearer
//! challenge, 500, or 503. The `Display` text of a [`VerifyError`] carries the
//! internal detail (which key id, which provider call) and is meant for logs
//! only; callers building a response use [`VerifyError::public_message`].

use http::{HeaderValue, StatusCode};
use thiserror::Error;

/// Result type alias for verification operations
pub type Result<T> = std::result::Result<T, VerifyError>;

/// `WWW-Authenticate` challenge sent with every 401
pub const BEARER_CHALLENGE: &str = "Bearer error=\"invalid_token\"";

/// Token verification errors
///
/// The error is `Clone` so a single failed provider fetch can be handed to
/// every caller that was waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// No cached value exists and the provider could not be reached
    #[error("identity provider unreachable: {0}")]
    ProviderUnreachable(String),

    /// The provider answered with data that could not be parsed
    #[error("malformed identity provider response: {0}")]
    MalformedProviderResponse(String),

    /// The token is not a well-formed compact JWS or lacks `kid`/`alg`
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// The token header declares an algorithm outside the allow-list
    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// No acceptable key with this identifier is published by the provider
    #[error("no acceptable key for kid '{0}'")]
    UnknownKeyId(String),

    /// A published key matched but its material could not be turned into a key
    #[error("could not construct verification key for kid '{kid}': {reason}")]
    KeyConstructionError {
        /// Key identifier of the offending entry
        kid: String,
        /// What was wrong with it
        reason: String,
    },

    /// Signature or claims rejected
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl VerifyError {
    /// Create a `ProviderUnreachable` error
    pub fn provider_unreachable(message: impl Into<String>) -> Self {
        Self::ProviderUnreachable(message.into())
    }

    /// Create a `MalformedProviderResponse` error
    pub fn malformed_provider_response(message: impl Into<String>) -> Self {
        Self::MalformedProviderResponse(message.into())
    }

    /// Create a `MalformedToken` error
    pub fn malformed_token(message: impl Into<String>) -> Self {
        Self::MalformedToken(message.into())
    }

    /// Create an `AuthenticationFailed` error
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed(message.into())
    }

    /// Create a `KeyConstructionError`
    pub fn key_construction(kid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::KeyConstructionError {
            kid: kid.into(),
            reason: reason.into(),
        }
    }

    /// Stable, machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProviderUnreachable(_) => "provider_unreachable",
            Self::MalformedProviderResponse(_) => "malformed_provider_response",
            Self::MalformedToken(_) => "malformed_token",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::UnknownKeyId(_) => "unknown_key_id",
            Self::KeyConstructionError { .. } => "key_construction_error",
            Self::AuthenticationFailed(_) => "authentication_failed",
        }
    }

    /// HTTP status a request handler should answer with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ProviderUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::MalformedProviderResponse(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MalformedToken(_)
            | Self::UnsupportedAlgorithm(_)
            | Self::UnknownKeyId(_)
            | Self::KeyConstructionError { .. }
            | Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Generic message safe to return to the caller
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::ProviderUnreachable(_) => "Authentication service temporarily unavailable.",
            Self::MalformedProviderResponse(_) => "Error processing authentication provider response.",
            _ => "Invalid or expired token.",
        }
    }

    /// `WWW-Authenticate` value for 401 responses
    pub fn challenge(&self) -> Option<HeaderValue> {
        (self.status_code() == StatusCode::UNAUTHORIZED)
            .then(|| HeaderValue::from_static(BEARER_CHALLENGE))
    }

    /// Whether the failure is the caller's (401) rather than the service's
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Configuration errors raised at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// A setting is present but unusable
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Setting name
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// The environment source could not be read or deserialized
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The outbound HTTP client could not be built
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

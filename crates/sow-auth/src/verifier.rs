//! Bearer token verification
//!
//! [`TokenVerifier::verify`] checks a compact JWS against the provider's
//! published keys:
//!
//! 1. Inspect the header without trusting it: `kid` and `alg` must be present
//! 2. Reject any `alg` other than the configured one before touching a key
//! 3. Resolve the key through the public key cache (and, on a miss, the
//!    JWKS and discovery caches behind it)
//! 4. Check the signature with exactly that key and algorithm
//! 5. Check `iss`, `aud`, `exp`, `iat` and `nbf`
//!
//! Each call is independent. Nothing is retried.

use std::str::FromStr;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::HeaderMap;
use http::header::AUTHORIZATION;
use jsonwebtoken::{Algorithm, TokenData, Validation, decode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cache::{CachePolicy, Clock, SystemClock};
use crate::config::VerifierConfig;
use crate::discovery::DiscoveryCache;
use crate::error::{ConfigError, Result, VerifyError};
use crate::jwks::JwksCache;
use crate::keys::PublicKeyCache;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Claims of a verified token
///
/// Every member of the payload is kept; the accessors cover the registered
/// claims callers usually need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerifiedClaims(Map<String, Value>);

impl VerifiedClaims {
    /// `iss`
    pub fn issuer(&self) -> Option<&str> {
        self.0.get("iss").and_then(Value::as_str)
    }

    /// `sub`
    pub fn subject(&self) -> Option<&str> {
        self.0.get("sub").and_then(Value::as_str)
    }

    /// `aud`, normalized to a list whether it was sent as a string or an array
    pub fn audience(&self) -> Vec<&str> {
        match self.0.get("aud") {
            Some(Value::String(aud)) => vec![aud.as_str()],
            Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// `exp` as seconds since the epoch
    pub fn expires_at(&self) -> Option<u64> {
        self.numeric("exp")
    }

    /// `iat` as seconds since the epoch
    pub fn issued_at(&self) -> Option<u64> {
        self.numeric("iat")
    }

    /// `nbf` as seconds since the epoch
    pub fn not_before(&self) -> Option<u64> {
        self.numeric("nbf")
    }

    /// `preferred_username` (OIDC standard claim)
    pub fn preferred_username(&self) -> Option<&str> {
        self.0.get("preferred_username").and_then(Value::as_str)
    }

    /// Any claim by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Borrow the full claim map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Take the full claim map
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    fn numeric(&self, name: &str) -> Option<u64> {
        let value = self.0.get(name)?;
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    }
}

/// The two header members the verifier relies on, read before verification
#[derive(Debug, Clone, PartialEq, Eq)]
struct UnverifiedHeader {
    alg: String,
    kid: String,
}

fn inspect_header(token: &str) -> Result<UnverifiedHeader> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(VerifyError::malformed_token(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(VerifyError::malformed_token("empty token segment"));
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(segments[0])
        .map_err(|e| VerifyError::malformed_token(format!("header is not base64url: {e}")))?;
    let header: Map<String, Value> = serde_json::from_slice(&bytes)
        .map_err(|e| VerifyError::malformed_token(format!("header is not a JSON object: {e}")))?;

    let member = |name: &str| {
        header
            .get(name)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| VerifyError::malformed_token(format!("header lacks '{name}'")))
    };

    Ok(UnverifiedHeader {
        alg: member("alg")?,
        kid: member("kid")?,
    })
}

/// Extract the token from an `Authorization: Bearer <token>` value
///
/// The scheme is matched case-insensitively.
///
/// # Errors
///
/// Returns [`VerifyError::MalformedToken`] for any other scheme or an empty token.
pub fn bearer_token(header_value: &str) -> Result<&str> {
    let (scheme, token) = header_value
        .trim()
        .split_once(' ')
        .ok_or_else(|| VerifyError::malformed_token("authorization header is not 'Bearer <token>'"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(VerifyError::malformed_token(format!(
            "unsupported authorization scheme '{scheme}'"
        )));
    }

    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(VerifyError::malformed_token("bearer token is empty or contains whitespace"));
    }
    Ok(token)
}

/// Verifies bearer tokens against an OpenID Connect provider
///
/// Owns the whole cache chain. Build one per provider at startup and share it
/// (it is `Send + Sync`); every cache lives as long as the verifier.
///
/// ```rust,no_run
/// use sow_auth::{TokenVerifier, VerifierConfig};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = VerifierConfig::new("https://idp.example.com/realms/sow")?
///     .with_audience("sow-api");
/// let verifier = TokenVerifier::new(config)?;
///
/// let claims = verifier.verify("eyJhbGciOiJSUzI1NiIsImtpZCI6...").await?;
/// println!("hello {}", claims.preferred_username().unwrap_or("anonymous"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TokenVerifier {
    config: VerifierConfig,
    discovery: Arc<DiscoveryCache>,
    jwks: Arc<JwksCache>,
    keys: PublicKeyCache,
    validation: Validation,
}

impl TokenVerifier {
    /// Create a verifier with a pooled reqwest transport and the system clock
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: VerifierConfig) -> std::result::Result<Self, ConfigError> {
        let transport = Arc::new(ReqwestTransport::from_config(&config)?);
        Self::with_transport(config, transport, Arc::new(SystemClock))
    }

    /// Load the configuration from the environment and create a verifier
    ///
    /// # Errors
    ///
    /// See [`VerifierConfig::from_env`] and [`TokenVerifier::new`].
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::new(VerifierConfig::from_env()?)
    }

    /// Create a verifier over an explicit transport and clock
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn with_transport(
        config: VerifierConfig,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let policy = CachePolicy::new(config.cache_ttl).with_max_staleness(config.max_staleness);
        let discovery = Arc::new(DiscoveryCache::new(
            config.discovery_url(),
            Arc::clone(&transport),
            Arc::clone(&clock),
            policy,
        ));
        let jwks = Arc::new(JwksCache::new(
            Arc::clone(&discovery),
            transport,
            Arc::clone(&clock),
            policy,
        ));
        let keys = PublicKeyCache::new(Arc::clone(&jwks), clock, config.cache_ttl, config.algorithm);

        let mut validation = Validation::new(config.algorithm);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "aud"]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = config.clock_skew.as_secs();

        info!(
            provider = %config.provider_url,
            issuer = %config.issuer,
            audience = %config.audience,
            algorithm = ?config.algorithm,
            "Token verifier initialized"
        );

        Ok(Self {
            config,
            discovery,
            jwks,
            keys,
            validation,
        })
    }

    /// Verify a raw compact JWS and return its claims
    ///
    /// # Errors
    ///
    /// - [`VerifyError::MalformedToken`] if the token or its header is unreadable
    /// - [`VerifyError::UnsupportedAlgorithm`] if `alg` is not the configured one
    /// - [`VerifyError::AuthenticationFailed`] for an unknown key, a bad
    ///   signature, or rejected claims
    /// - [`VerifyError::KeyConstructionError`] if the provider published an
    ///   unusable key under the token's `kid`
    /// - [`VerifyError::ProviderUnreachable`] or
    ///   [`VerifyError::MalformedProviderResponse`] if keys could not be obtained
    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims> {
        match self.verify_inner(token).await {
            Ok(claims) => {
                info!(
                    username = claims.preferred_username().unwrap_or("<none>"),
                    subject = claims.subject().unwrap_or("<none>"),
                    "Token verified"
                );
                Ok(claims)
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "Token rejected");
                Err(e)
            }
        }
    }

    async fn verify_inner(&self, token: &str) -> Result<VerifiedClaims> {
        let header = inspect_header(token)?;

        let algorithm = Algorithm::from_str(&header.alg)
            .ok()
            .filter(|alg| *alg == self.config.algorithm)
            .ok_or_else(|| VerifyError::UnsupportedAlgorithm(header.alg.clone()))?;

        debug!(kid = %header.kid, alg = ?algorithm, "Resolving verification key");
        let key = match self.keys.get_verification_key(&header.kid).await {
            Ok(key) => key,
            Err(VerifyError::UnknownKeyId(kid)) => {
                return Err(VerifyError::authentication_failed(format!(
                    "no acceptable key for kid '{kid}'"
                )));
            }
            Err(e) => return Err(e),
        };

        let data: TokenData<VerifiedClaims> = decode(token, key.decoding_key(), &self.validation)
            .map_err(|e| VerifyError::authentication_failed(e.to_string()))?;

        check_time_claims(&data.claims, self.validation.leeway)?;
        Ok(data.claims)
    }

    /// Verify the bearer token carried in a request's `Authorization` header
    ///
    /// # Errors
    ///
    /// [`VerifyError::MalformedToken`] if the header is absent or not a bearer
    /// credential, otherwise as [`TokenVerifier::verify`].
    pub async fn verify_authorization_header(&self, headers: &HeaderMap) -> Result<VerifiedClaims> {
        let value = headers
            .get(AUTHORIZATION)
            .ok_or_else(|| VerifyError::malformed_token("missing Authorization header"))?
            .to_str()
            .map_err(|_| VerifyError::malformed_token("Authorization header is not ASCII"))?;

        self.verify(bearer_token(value)?).await
    }

    /// Active configuration
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// The discovery cache
    pub fn discovery(&self) -> &Arc<DiscoveryCache> {
        &self.discovery
    }

    /// The JWKS cache
    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    /// The public key cache
    pub fn keys(&self) -> &PublicKeyCache {
        &self.keys
    }
}

/// `iat` and `nbf` checks that signature validation does not cover
fn check_time_claims(claims: &VerifiedClaims, leeway: u64) -> Result<()> {
    let now = jsonwebtoken::get_current_timestamp();

    let exp = claims
        .expires_at()
        .ok_or_else(|| VerifyError::authentication_failed("exp is not a valid timestamp"))?;
    let iat = claims
        .issued_at()
        .ok_or_else(|| VerifyError::authentication_failed("missing or invalid iat"))?;

    if iat > now.saturating_add(leeway) {
        return Err(VerifyError::authentication_failed("token issued in the future"));
    }
    if iat > exp {
        return Err(VerifyError::authentication_failed("iat is after exp"));
    }
    if claims.get("nbf").is_some() {
        let nbf = claims
            .not_before()
            .ok_or_else(|| VerifyError::authentication_failed("nbf is not a valid timestamp"))?;
        if nbf > exp {
            return Err(VerifyError::authentication_failed("nbf is after exp"));
        }
    }
    Ok(())
}

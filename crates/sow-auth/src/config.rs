//! Verifier configuration
//!
//! Settings are sourced from `IDP_*` environment variables and validated once
//! at startup. A missing provider URL is a hard failure; everything else has a
//! default.
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `IDP_URL` | identity provider base URL | required |
//! | `IDP_AUDIENCE` | expected `aud` | `your-default-audience` |
//! | `IDP_ISSUER` | expected `iss` | `IDP_URL` without trailing `/` |
//! | `IDP_ALGORITHM` | the single accepted signing algorithm | `RS256` |
//! | `IDP_CACHE_TTL_SECS` | freshness window of every cache | `300` |
//! | `IDP_HTTP_TIMEOUT_SECS` | per-call timeout of the transport | `10` |
//! | `IDP_CLOCK_SKEW_SECS` | leeway on `exp`/`nbf`/`iat` | `0` |
//! | `IDP_MAX_STALENESS_SECS` | ceiling on stale fallback | unbounded |

use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::ConfigError;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "IDP";

/// Audience used when none is configured. Production deployments must override it.
pub const DEFAULT_AUDIENCE: &str = "your-default-audience";

/// Freshness window shared by the discovery, JWKS and public key caches
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Per-call timeout of the outbound HTTP transport
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the OIDC discovery document relative to the provider base URL
pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// Algorithms a verifier may be configured with. Symmetric and `none` schemes
/// are never accepted.
const RSA_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// Raw, unvalidated settings as read from the environment
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    url: Option<String>,
    audience: Option<String>,
    issuer: Option<String>,
    algorithm: Option<String>,
    cache_ttl_secs: Option<u64>,
    http_timeout_secs: Option<u64>,
    clock_skew_secs: Option<u64>,
    max_staleness_secs: Option<u64>,
}

/// Validated verifier configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierConfig {
    /// Identity provider base URL
    pub provider_url: Url,
    /// Expected `aud` claim
    pub audience: String,
    /// Expected `iss` claim
    pub issuer: String,
    /// The single allowed signing algorithm
    pub algorithm: Algorithm,
    /// Freshness window of every cache
    pub cache_ttl: Duration,
    /// Outbound HTTP timeout
    pub http_timeout: Duration,
    /// Leeway applied to time-based claims
    pub clock_skew: Duration,
    /// Maximum age past the TTL at which stale data may still be served
    pub max_staleness: Option<Duration>,
}

impl VerifierConfig {
    /// Create a configuration for a provider with every other setting defaulted
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the URL is not an absolute http(s) URL.
    pub fn new(provider_url: &str) -> Result<Self, ConfigError> {
        let provider_url_str = provider_url.trim();
        if provider_url_str.is_empty() {
            return Err(ConfigError::Missing("IDP_URL"));
        }
        let parsed = parse_provider_url(provider_url_str)?;

        Ok(Self {
            provider_url: parsed,
            audience: DEFAULT_AUDIENCE.to_string(),
            issuer: provider_url_str.trim_end_matches('/').to_string(),
            algorithm: Algorithm::RS256,
            cache_ttl: DEFAULT_CACHE_TTL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            clock_skew: Duration::ZERO,
            max_staleness: None,
        })
    }

    /// Load and validate the configuration from `IDP_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `IDP_URL` is absent or any value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(
            config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
        )
    }

    /// Load the configuration from an explicit variable map instead of the
    /// process environment. Keys carry the `IDP_` prefix.
    ///
    /// # Errors
    ///
    /// Same as [`VerifierConfig::from_env`].
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Self::from_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(Some(map)),
        )
    }

    fn from_source(source: config::Environment) -> Result<Self, ConfigError> {
        let raw: RawSettings = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let url = non_blank(raw.url).ok_or(ConfigError::Missing("IDP_URL"))?;
        let mut config = Self::new(&url)?;

        match non_blank(raw.audience) {
            Some(audience) => config.audience = audience,
            None => warn!(
                audience = DEFAULT_AUDIENCE,
                "IDP_AUDIENCE not set, using placeholder audience"
            ),
        }
        if let Some(issuer) = non_blank(raw.issuer) {
            config.issuer = issuer;
        }
        if let Some(algorithm) = non_blank(raw.algorithm) {
            config.algorithm = Algorithm::from_str(&algorithm)
                .map_err(|_| ConfigError::invalid("IDP_ALGORITHM", format!("unknown algorithm '{algorithm}'")))?;
        }
        if let Some(secs) = raw.cache_ttl_secs {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.http_timeout_secs {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.clock_skew_secs {
            config.clock_skew = Duration::from_secs(secs);
        }
        config.max_staleness = raw.max_staleness_secs.map(Duration::from_secs);

        config.validate()?;
        Ok(config)
    }

    /// Set the expected audience
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    /// Set the expected issuer
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Set the allowed algorithm
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the HTTP timeout
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Set the clock skew leeway
    pub fn with_clock_skew(mut self, leeway: Duration) -> Self {
        self.clock_skew = leeway;
        self
    }

    /// Bound how long stale provider data may be served after the TTL
    pub fn with_max_staleness(mut self, ceiling: Duration) -> Self {
        self.max_staleness = Some(ceiling);
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty audience or issuer, a
    /// non-RSA algorithm, or a zero TTL/timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audience.trim().is_empty() {
            return Err(ConfigError::invalid("IDP_AUDIENCE", "must not be empty"));
        }
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::invalid("IDP_ISSUER", "must not be empty"));
        }
        if !RSA_ALGORITHMS.contains(&self.algorithm) {
            return Err(ConfigError::invalid(
                "IDP_ALGORITHM",
                format!("{:?} is not an asymmetric RSA algorithm", self.algorithm),
            ));
        }
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::invalid("IDP_CACHE_TTL_SECS", "must be greater than zero"));
        }
        if self.http_timeout.is_zero() {
            return Err(ConfigError::invalid("IDP_HTTP_TIMEOUT_SECS", "must be greater than zero"));
        }
        Ok(())
    }

    /// Full URL of the provider's discovery document
    pub fn discovery_url(&self) -> String {
        format!(
            "{}{}",
            self.provider_url.as_str().trim_end_matches('/'),
            DISCOVERY_PATH
        )
    }
}

fn parse_provider_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::invalid("IDP_URL", e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::invalid("IDP_URL", "scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::invalid("IDP_URL", "missing host"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(ConfigError::invalid(
            "IDP_URL",
            "must not contain a query string or fragment",
        ));
    }
    Ok(url)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VerifierConfig::new("https://idp.example.com/realms/sow/").unwrap();
        assert_eq!(config.audience, DEFAULT_AUDIENCE);
        assert_eq!(config.issuer, "https://idp.example.com/realms/sow");
        assert_eq!(config.algorithm, Algorithm::RS256);
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.http_timeout, Duration::from_secs(10));
        assert_eq!(config.clock_skew, Duration::ZERO);
        assert!(config.max_staleness.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_discovery_url() {
        let config = VerifierConfig::new("https://idp.example.com/realms/sow/").unwrap();
        assert_eq!(
            config.discovery_url(),
            "https://idp.example.com/realms/sow/.well-known/openid-configuration"
        );

        let config = VerifierConfig::new("http://localhost:8080").unwrap();
        assert_eq!(
            config.discovery_url(),
            "http://localhost:8080/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_missing_url_is_fatal() {
        let err = VerifierConfig::from_vars([("IDP_AUDIENCE", "sow-api")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("IDP_URL")));

        let err = VerifierConfig::from_vars([("IDP_URL", "   ")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("IDP_URL")));
    }

    #[test]
    fn test_from_vars() {
        let config = VerifierConfig::from_vars([
            ("IDP_URL", "https://idp.example.com"),
            ("IDP_AUDIENCE", "sow-api"),
            ("IDP_ISSUER", "https://issuer.example.com"),
            ("IDP_ALGORITHM", "PS256"),
            ("IDP_CACHE_TTL_SECS", "60"),
            ("IDP_HTTP_TIMEOUT_SECS", "3"),
            ("IDP_CLOCK_SKEW_SECS", "30"),
            ("IDP_MAX_STALENESS_SECS", "900"),
        ])
        .unwrap();

        assert_eq!(config.audience, "sow-api");
        assert_eq!(config.issuer, "https://issuer.example.com");
        assert_eq!(config.algorithm, Algorithm::PS256);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.http_timeout, Duration::from_secs(3));
        assert_eq!(config.clock_skew, Duration::from_secs(30));
        assert_eq!(config.max_staleness, Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_rejects_symmetric_algorithm() {
        let err = VerifierConfig::from_vars([
            ("IDP_URL", "https://idp.example.com"),
            ("IDP_ALGORITHM", "HS256"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "IDP_ALGORITHM", .. }));

        let err = VerifierConfig::from_vars([
            ("IDP_URL", "https://idp.example.com"),
            ("IDP_ALGORITHM", "none"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "IDP_ALGORITHM", .. }));
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(VerifierConfig::new("ftp://idp.example.com").is_err());
        assert!(VerifierConfig::new("not a url").is_err());
        assert!(VerifierConfig::new("https://idp.example.com?realm=x").is_err());
    }

    #[test]
    fn test_rejects_zero_durations() {
        let err = VerifierConfig::from_vars([
            ("IDP_URL", "https://idp.example.com"),
            ("IDP_CACHE_TTL_SECS", "0"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "IDP_CACHE_TTL_SECS", .. }));

        let config = VerifierConfig::new("https://idp.example.com")
            .unwrap()
            .with_http_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}

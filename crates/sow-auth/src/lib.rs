//! # sow-auth - OIDC Bearer Token Verification
//!
//! Verifies JWT access tokens issued by an OpenID Connect provider against the
//! provider's published signing keys, with layered caching so that a steady
//! stream of valid tokens costs no network round-trips.
//!
//! ## Architecture
//!
//! ```text
//! TokenVerifier -> PublicKeyCache -> JwksCache -> DiscoveryCache -> HttpTransport -> provider
//! ```
//!
//! - [`verifier`] - header inspection, key resolution, signature and claims checks
//! - [`keys`] - verification keys derived per `kid`, invalidated on key rotation
//! - [`jwks`] - the provider's key set, following the advertised `jwks_uri`
//! - [`discovery`] - the provider's `/.well-known/openid-configuration`
//! - [`transport`] - pooled outbound HTTP
//! - [`cache`] - freshness rules, clock, statistics, fetch collapsing
//! - [`config`] - `IDP_*` environment configuration
//! - [`error`] - error kinds and their HTTP mapping
//!
//! Every cache keeps entries for a fixed TTL (300 s by default). When the
//! provider is unreachable the last fetched document or key set keeps being
//! served and a warning is logged; verification only fails with
//! `ProviderUnreachable` when nothing was ever fetched (or an optional
//! staleness ceiling is exceeded).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sow_auth::{TokenVerifier, VerifierConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // IDP_URL=https://idp.example.com/realms/sow IDP_AUDIENCE=sow-api
//! let verifier = TokenVerifier::new(VerifierConfig::from_env()?)?;
//!
//! match verifier.verify("eyJhbGciOi...").await {
//!     Ok(claims) => println!("subject: {:?}", claims.subject()),
//!     Err(e) => {
//!         // e.status_code(), e.public_message() and e.challenge() build the response
//!         eprintln!("{} {}", e.status_code(), e.public_message());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod jwks;
pub mod keys;
pub mod transport;
pub mod verifier;

pub use cache::{CacheStats, Clock, ManualClock, SystemClock};
pub use config::VerifierConfig;
pub use discovery::{DiscoveryCache, DiscoveryDocument};
pub use error::{BEARER_CHALLENGE, ConfigError, Result, VerifyError};
pub use jwks::{Jwk, JwksCache, KeySet, KeySetListener, RejectedKey};
pub use keys::{PublicKeyCache, VerificationKey};
pub use transport::{HttpTransport, ReqwestTransport, TransportError};
pub use verifier::{TokenVerifier, VerifiedClaims, bearer_token};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

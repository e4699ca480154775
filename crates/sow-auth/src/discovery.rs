//! OpenID Connect discovery document fetching and caching
//!
//! The discovery document is fetched from
//! `<provider>/.well-known/openid-configuration` and kept for one TTL window.
//! Only `jwks_uri` is interpreted; every other member is preserved as-is.
//!
//! When the provider cannot be reached, the last document ever fetched keeps
//! being served (optionally bounded by a staleness ceiling). A response that
//! arrives but cannot be parsed is always an error.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheCounters, CacheEntry, CachePolicy, CacheStats, Clock, SingleFlight};
use crate::error::{Result, VerifyError};
use crate::transport::HttpTransport;

/// Singleflight identity of the discovery fetch
const DISCOVERY_FLIGHT: &str = "discovery";

/// OpenID Provider metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Location of the provider's signing keys
    pub jwks_uri: String,

    /// Every other member of the document, `issuer` included
    #[serde(flatten)]
    pub additional: serde_json::Map<String, serde_json::Value>,
}

impl DiscoveryDocument {
    /// Issuer identifier advertised by the provider, when it is a string
    ///
    /// Informational only; the configured issuer is what tokens are checked
    /// against.
    pub fn issuer(&self) -> Option<&str> {
        self.additional.get("issuer").and_then(serde_json::Value::as_str)
    }

    /// Parse and check a raw discovery response
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::MalformedProviderResponse`] if the body is not a
    /// JSON object or `jwks_uri` is missing, empty, or not an absolute URL.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let document: Self = serde_json::from_slice(body).map_err(|e| {
            VerifyError::malformed_provider_response(format!("invalid discovery document: {e}"))
        })?;

        if document.jwks_uri.trim().is_empty() {
            return Err(VerifyError::malformed_provider_response(
                "discovery document has an empty jwks_uri",
            ));
        }
        Url::parse(&document.jwks_uri).map_err(|e| {
            VerifyError::malformed_provider_response(format!(
                "discovery document jwks_uri '{}' is not a URL: {e}",
                document.jwks_uri
            ))
        })?;

        Ok(document)
    }
}

/// Shared state reachable from the spawned fetch task
#[derive(Debug)]
struct DiscoveryState {
    discovery_url: String,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    policy: CachePolicy,
    entry: RwLock<Option<CacheEntry<Arc<DiscoveryDocument>>>>,
    counters: CacheCounters,
}

impl DiscoveryState {
    fn fresh(&self) -> Option<Arc<DiscoveryDocument>> {
        let now = self.clock.now();
        let entry = self.entry.read();
        entry
            .as_ref()
            .filter(|cached| cached.is_fresh(now, self.policy.ttl))
            .map(|cached| Arc::clone(cached.value()))
    }

    async fn refresh(&self) -> Result<Arc<DiscoveryDocument>> {
        // A flight that finished between our miss and this one already did the work.
        if let Some(document) = self.fresh() {
            self.counters.hit();
            return Ok(document);
        }

        self.counters.fetch();
        info!(url = %self.discovery_url, "Fetching discovery document");

        let body = match self.transport.get(&self.discovery_url).await {
            Ok(body) => body,
            Err(e) => return self.fall_back(e.to_string()),
        };

        let document = match DiscoveryDocument::from_slice(&body) {
            Ok(document) => Arc::new(document),
            Err(e) => {
                self.counters.failure();
                error!(url = %self.discovery_url, error = %e, "Discovery document rejected");
                return Err(e);
            }
        };

        *self.entry.write() = Some(CacheEntry::new(Arc::clone(&document), self.clock.now()));
        debug!(jwks_uri = %document.jwks_uri, "Discovery document cached");
        Ok(document)
    }

    fn fall_back(&self, reason: String) -> Result<Arc<DiscoveryDocument>> {
        let now = self.clock.now();
        let entry = self.entry.read();

        match entry.as_ref() {
            Some(cached) if self.policy.allows_stale(cached, now) => {
                self.counters.stale();
                warn!(
                    url = %self.discovery_url,
                    error = %reason,
                    age_secs = cached.age(now).map(|age| age.as_secs()).unwrap_or(0),
                    "Identity provider unreachable, serving stale discovery document"
                );
                Ok(Arc::clone(cached.value()))
            }
            Some(_) => {
                self.counters.failure();
                error!(
                    url = %self.discovery_url,
                    error = %reason,
                    "Identity provider unreachable and cached discovery document exceeds staleness ceiling"
                );
                Err(VerifyError::provider_unreachable(reason))
            }
            None => {
                self.counters.failure();
                error!(url = %self.discovery_url, error = %reason, "Identity provider unreachable");
                Err(VerifyError::provider_unreachable(reason))
            }
        }
    }
}

/// Cache for the provider's discovery document
#[derive(Debug)]
pub struct DiscoveryCache {
    state: Arc<DiscoveryState>,
    flights: SingleFlight<Arc<DiscoveryDocument>>,
}

impl DiscoveryCache {
    /// Create a cache for the document at `discovery_url`
    pub fn new(
        discovery_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            state: Arc::new(DiscoveryState {
                discovery_url: discovery_url.into(),
                transport,
                clock,
                policy,
                entry: RwLock::new(None),
                counters: CacheCounters::default(),
            }),
            flights: SingleFlight::new(),
        }
    }

    /// Get the discovery document, fetching it if the cached copy is not fresh
    ///
    /// # Errors
    ///
    /// - [`VerifyError::ProviderUnreachable`] if the fetch failed and no
    ///   servable cached document exists
    /// - [`VerifyError::MalformedProviderResponse`] if the provider answered
    ///   with an unusable document
    pub async fn get_document(&self) -> Result<Arc<DiscoveryDocument>> {
        if let Some(document) = self.state.fresh() {
            self.state.counters.hit();
            debug!("Using cached discovery document");
            return Ok(document);
        }

        let state = Arc::clone(&self.state);
        self.flights
            .run(DISCOVERY_FLIGHT, async move { state.refresh().await })
            .await
    }

    /// The cached document regardless of freshness
    pub fn cached(&self) -> Option<Arc<DiscoveryDocument>> {
        self.state
            .entry
            .read()
            .as_ref()
            .map(|cached| Arc::clone(cached.value()))
    }

    /// Drop the cached document; the next call fetches
    pub fn invalidate(&self) {
        *self.state.entry.write() = None;
    }

    /// URL the document is fetched from
    pub fn discovery_url(&self) -> &str {
        &self.state.discovery_url
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        self.state.counters.snapshot()
    }
}

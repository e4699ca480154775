//! JWKS (JSON Web Key Set) fetching and caching
//!
//! The key set is fetched from whatever `jwks_uri` the discovery document
//! currently advertises. A cached set is only reused while it is fresh and
//! came from that same URI; if the provider moves its keys, the next lookup
//! refetches even inside the TTL window.
//!
//! Every successful fetch produces a new [`KeySet`] generation and notifies
//! the registered [`KeySetListener`]s, which is how derived verification keys
//! get invalidated on rotation.
//!
//! Entries of `keys` are read one at a time. An entry that does not fit the
//! [`Jwk`] shape is set aside as a [`RejectedKey`] instead of failing the
//! whole set, so one odd key cannot lock out tokens signed by the others.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheCounters, CacheEntry, CachePolicy, CacheStats, Clock, SingleFlight};
use crate::discovery::DiscoveryCache;
use crate::error::{Result, VerifyError};
use crate::transport::HttpTransport;

/// One published key, as it appears on the wire
///
/// Fields the verifier does not read are kept in `additional`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (`RSA`, `EC`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kty: Option<String>,

    /// Key identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Intended use (`sig` or `enc`)
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    /// Algorithm the key is meant for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// RSA modulus, base64url
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA public exponent, base64url
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    /// Every other member (`x5c`, `x5t`, curve parameters, ...)
    #[serde(flatten)]
    pub additional: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<serde_json::Value>,
}

/// A published entry that could not be read as a [`Jwk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedKey {
    kid: Option<String>,
    reason: String,
}

impl RejectedKey {
    /// Key identifier, if the entry carried a string `kid`
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Why the entry was rejected
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A fetched key set, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    keys: Vec<Jwk>,
    rejected: Vec<RejectedKey>,
    jwks_uri: String,
    generation: u64,
}

impl KeySet {
    /// Parse a JWKS response body
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::MalformedProviderResponse`] if the body is not a
    /// JSON object with a `keys` array. Individual entries that are not valid
    /// JWKs are kept as [`RejectedKey`]s.
    pub fn from_slice(body: &[u8], jwks_uri: impl Into<String>, generation: u64) -> Result<Self> {
        let jwks_uri = jwks_uri.into();
        let document: JwksDocument = serde_json::from_slice(body).map_err(|e| {
            VerifyError::malformed_provider_response(format!("invalid JWKS document: {e}"))
        })?;

        let mut keys = Vec::with_capacity(document.keys.len());
        let mut rejected = Vec::new();
        for entry in document.keys {
            let kid = entry
                .get("kid")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            match serde_json::from_value::<Jwk>(entry) {
                Ok(jwk) => keys.push(jwk),
                Err(e) => {
                    warn!(
                        jwks_uri = %jwks_uri,
                        kid = kid.as_deref().unwrap_or("-"),
                        error = %e,
                        "Skipping unreadable JWKS entry"
                    );
                    rejected.push(RejectedKey {
                        kid,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            keys,
            rejected,
            jwks_uri,
            generation,
        })
    }

    /// All published keys in provider order
    pub fn keys(&self) -> &[Jwk] {
        &self.keys
    }

    /// Keys carrying the given identifier, in provider order
    pub fn find<'a>(&'a self, kid: &'a str) -> impl Iterator<Item = &'a Jwk> + 'a {
        self.keys
            .iter()
            .filter(move |key| key.kid.as_deref() == Some(kid))
    }

    /// Unreadable entries carrying the given identifier
    pub fn find_rejected<'a>(&'a self, kid: &'a str) -> impl Iterator<Item = &'a RejectedKey> + 'a {
        self.rejected
            .iter()
            .filter(move |entry| entry.kid.as_deref() == Some(kid))
    }

    /// Every unreadable entry, in provider order
    pub fn rejected(&self) -> &[RejectedKey] {
        &self.rejected
    }

    /// URI the set was fetched from
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Monotonic fetch counter of the owning cache
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of readable published keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the provider published no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Observer of key set replacement
pub trait KeySetListener: Send + Sync + fmt::Debug {
    /// Called after a key set of `generation` replaced its predecessor
    fn key_set_replaced(&self, generation: u64);
}

#[derive(Debug, Default)]
struct KeySetSlot {
    current: Option<CacheEntry<Arc<KeySet>>>,
    generation: u64,
}

#[derive(Debug)]
struct JwksState {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    policy: CachePolicy,
    slot: RwLock<KeySetSlot>,
    listeners: RwLock<Vec<Arc<dyn KeySetListener>>>,
    counters: CacheCounters,
}

impl JwksState {
    fn fresh(&self, jwks_uri: &str) -> Option<Arc<KeySet>> {
        let now = self.clock.now();
        let slot = self.slot.read();
        slot.current
            .as_ref()
            .filter(|cached| cached.value().jwks_uri == jwks_uri)
            .filter(|cached| cached.is_fresh(now, self.policy.ttl))
            .map(|cached| Arc::clone(cached.value()))
    }

    async fn refresh(&self, jwks_uri: String) -> Result<Arc<KeySet>> {
        if let Some(key_set) = self.fresh(&jwks_uri) {
            self.counters.hit();
            return Ok(key_set);
        }

        self.counters.fetch();
        info!(jwks_uri = %jwks_uri, "Fetching JWKS from endpoint");

        let body = match self.transport.get(&jwks_uri).await {
            Ok(body) => body,
            Err(e) => return self.fall_back(&jwks_uri, e.to_string()),
        };

        // Parse with a placeholder generation; the real one is assigned under
        // the write lock so generations follow publication order.
        let parsed = match KeySet::from_slice(&body, jwks_uri.as_str(), 0) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.counters.failure();
                error!(jwks_uri = %jwks_uri, error = %e, "JWKS document rejected");
                return Err(e);
            }
        };

        let key_set = {
            let mut slot = self.slot.write();
            slot.generation += 1;
            let key_set = Arc::new(KeySet {
                generation: slot.generation,
                ..parsed
            });
            slot.current = Some(CacheEntry::new(Arc::clone(&key_set), self.clock.now()));
            key_set
        };

        info!(
            jwks_uri = %jwks_uri,
            key_count = key_set.len(),
            generation = key_set.generation,
            "JWKS cached"
        );

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.key_set_replaced(key_set.generation);
        }

        Ok(key_set)
    }

    fn fall_back(&self, jwks_uri: &str, reason: String) -> Result<Arc<KeySet>> {
        let now = self.clock.now();
        let slot = self.slot.read();

        let servable = slot
            .current
            .as_ref()
            .filter(|cached| cached.value().jwks_uri == jwks_uri);

        match servable {
            Some(cached) if self.policy.allows_stale(cached, now) => {
                self.counters.stale();
                warn!(
                    jwks_uri = %jwks_uri,
                    error = %reason,
                    generation = cached.value().generation,
                    "JWKS endpoint unreachable, serving stale key set"
                );
                Ok(Arc::clone(cached.value()))
            }
            _ => {
                self.counters.failure();
                error!(
                    jwks_uri = %jwks_uri,
                    error = %reason,
                    "JWKS endpoint unreachable and no servable key set cached"
                );
                Err(VerifyError::provider_unreachable(reason))
            }
        }
    }
}

/// Cache for the provider's signing key set
#[derive(Debug)]
pub struct JwksCache {
    discovery: Arc<DiscoveryCache>,
    state: Arc<JwksState>,
    flights: SingleFlight<Arc<KeySet>>,
}

impl JwksCache {
    /// Create a JWKS cache that follows the given discovery cache
    pub fn new(
        discovery: Arc<DiscoveryCache>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            discovery,
            state: Arc::new(JwksState {
                transport,
                clock,
                policy,
                slot: RwLock::new(KeySetSlot::default()),
                listeners: RwLock::new(Vec::new()),
                counters: CacheCounters::default(),
            }),
            flights: SingleFlight::new(),
        }
    }

    /// Register an observer of key set replacement
    pub fn subscribe(&self, listener: Arc<dyn KeySetListener>) {
        self.state.listeners.write().push(listener);
    }

    /// Get the current key set
    ///
    /// Resolves the JWKS URI through the discovery cache first, so discovery
    /// failures propagate unchanged.
    ///
    /// # Errors
    ///
    /// - [`VerifyError::ProviderUnreachable`] if the fetch failed and no
    ///   servable set from the same URI is cached
    /// - [`VerifyError::MalformedProviderResponse`] if either document is unusable
    pub async fn get_key_set(&self) -> Result<Arc<KeySet>> {
        let document = self.discovery.get_document().await?;
        let jwks_uri = document.jwks_uri.clone();

        if let Some(key_set) = self.state.fresh(&jwks_uri) {
            self.state.counters.hit();
            debug!(jwks_uri = %jwks_uri, "Using cached JWKS");
            return Ok(key_set);
        }

        let state = Arc::clone(&self.state);
        let flight_key = jwks_uri.clone();
        self.flights
            .run(&flight_key, async move { state.refresh(jwks_uri).await })
            .await
    }

    /// The cached set regardless of freshness or URI
    pub fn cached(&self) -> Option<Arc<KeySet>> {
        self.state
            .slot
            .read()
            .current
            .as_ref()
            .map(|cached| Arc::clone(cached.value()))
    }

    /// Generation of the most recently fetched set (0 before the first fetch)
    pub fn generation(&self) -> u64 {
        self.state.slot.read().generation
    }

    /// Drop the cached set; the next call fetches
    pub fn invalidate(&self) {
        self.state.slot.write().current = None;
    }

    /// The discovery cache this cache follows
    pub fn discovery(&self) -> &Arc<DiscoveryCache> {
        &self.discovery
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        self.state.counters.snapshot()
    }
}

//! Verification key derivation and caching
//!
//! Keys are derived lazily from the current [`KeySet`], one per key
//! identifier seen in incoming tokens. Every derived key remembers the key set
//! generation it came from; the store never accepts a key older than the
//! newest generation it has observed, and a key set replacement clears it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheCounters, CacheEntry, CacheStats, Clock};
use crate::error::{Result, VerifyError};
use crate::jwks::{Jwk, JwksCache, KeySet, KeySetListener};

/// A public key ready to check signatures
#[derive(Clone)]
pub struct VerificationKey {
    kid: String,
    algorithm: Algorithm,
    key: DecodingKey,
    generation: u64,
}

impl VerificationKey {
    /// Derive an RSA verification key from a published JWK
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::KeyConstructionError`] if the key is not RSA or
    /// its modulus/exponent are missing or not base64url.
    pub fn from_jwk(jwk: &Jwk, algorithm: Algorithm, generation: u64) -> Result<Self> {
        let kid = jwk.kid.clone().unwrap_or_default();

        match jwk.kty.as_deref() {
            Some("RSA") => {}
            Some(other) => {
                return Err(VerifyError::key_construction(
                    kid,
                    format!("unsupported key type '{other}'"),
                ));
            }
            None => return Err(VerifyError::key_construction(kid, "missing key type")),
        }

        let n = rsa_component(&kid, "n", jwk.n.as_deref())?;
        let e = rsa_component(&kid, "e", jwk.e.as_deref())?;

        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|err| VerifyError::key_construction(kid.as_str(), err.to_string()))?;

        Ok(Self {
            kid,
            algorithm,
            key,
            generation,
        })
    }

    /// Key identifier
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// The algorithm this key verifies
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Key material for `jsonwebtoken::decode`
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }

    /// Generation of the key set this key was derived from
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

fn rsa_component<'a>(kid: &str, name: &str, value: Option<&'a str>) -> Result<&'a str> {
    let value = value
        .map(|v| v.trim_end_matches('='))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| VerifyError::key_construction(kid, format!("missing RSA component '{name}'")))?;

    // Reject standard-alphabet or otherwise corrupt material up front.
    let decoded = URL_SAFE_NO_PAD.decode(value).map_err(|e| {
        VerifyError::key_construction(kid, format!("RSA component '{name}' is not base64url: {e}"))
    })?;
    if decoded.iter().all(|byte| *byte == 0) {
        return Err(VerifyError::key_construction(
            kid,
            format!("RSA component '{name}' is zero"),
        ));
    }

    Ok(value)
}

/// Whether a published key may be used to verify tokens signed with `allowed`
fn is_acceptable(jwk: &Jwk, allowed: Algorithm) -> bool {
    if jwk.key_use.as_deref().is_some_and(|key_use| key_use != "sig") {
        return false;
    }
    match jwk.alg.as_deref() {
        Some(alg) => Algorithm::from_str(alg).is_ok_and(|alg| alg == allowed),
        None => true,
    }
}

#[derive(Debug, Default)]
struct KeyStoreInner {
    generation: u64,
    entries: HashMap<String, CacheEntry<Arc<VerificationKey>>>,
}

/// Derived keys, partitioned by the key set generation they belong to
#[derive(Debug, Default)]
struct KeyStore {
    inner: RwLock<KeyStoreInner>,
}

impl KeyStore {
    fn fresh(&self, kid: &str, now: SystemTime, ttl: Duration) -> Option<Arc<VerificationKey>> {
        let inner = self.inner.read();
        inner
            .entries
            .get(kid)
            .filter(|cached| cached.is_fresh(now, ttl))
            .map(|cached| Arc::clone(cached.value()))
    }

    /// Store a key unless a newer generation has already been observed
    fn insert(&self, key: Arc<VerificationKey>, now: SystemTime) -> bool {
        let mut inner = self.inner.write();

        if key.generation < inner.generation {
            debug!(
                kid = %key.kid,
                key_generation = key.generation,
                store_generation = inner.generation,
                "Discarding key derived from a superseded key set"
            );
            return false;
        }
        if key.generation > inner.generation {
            inner.entries.clear();
            inner.generation = key.generation;
        }

        inner
            .entries
            .insert(key.kid.clone(), CacheEntry::new(key, now));
        true
    }

    fn clear(&self, generation: u64) {
        let mut inner = self.inner.write();
        if generation > inner.generation {
            let dropped = inner.entries.len();
            inner.entries.clear();
            inner.generation = generation;
            if dropped > 0 {
                info!(generation, dropped, "Key set replaced, cleared derived keys");
            }
        }
    }

    fn reset(&self) {
        self.inner.write().entries.clear();
    }

    fn len(&self) -> usize {
        self.inner.read().entries.len()
    }
}

impl KeySetListener for KeyStore {
    fn key_set_replaced(&self, generation: u64) {
        self.clear(generation);
    }
}

/// Cache of verification keys by key identifier
#[derive(Debug)]
pub struct PublicKeyCache {
    jwks: Arc<JwksCache>,
    store: Arc<KeyStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    algorithm: Algorithm,
    counters: CacheCounters,
}

impl PublicKeyCache {
    /// Create a key cache over `jwks` and subscribe it to key set replacement
    pub fn new(
        jwks: Arc<JwksCache>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        algorithm: Algorithm,
    ) -> Self {
        let store = Arc::new(KeyStore::default());
        jwks.subscribe(Arc::clone(&store) as Arc<dyn KeySetListener>);

        Self {
            jwks,
            store,
            clock,
            ttl,
            algorithm,
            counters: CacheCounters::default(),
        }
    }

    /// Get the verification key for `kid`
    ///
    /// # Errors
    ///
    /// - [`VerifyError::UnknownKeyId`] if no acceptable published key has this id
    /// - [`VerifyError::KeyConstructionError`] if the matching key is unusable,
    ///   including a published entry with this id that is not a readable JWK
    /// - any error of [`JwksCache::get_key_set`]
    pub async fn get_verification_key(&self, kid: &str) -> Result<Arc<VerificationKey>> {
        if let Some(key) = self.store.fresh(kid, self.clock.now(), self.ttl) {
            self.counters.hit();
            return Ok(key);
        }

        let key_set = match self.jwks.get_key_set().await {
            Ok(key_set) => key_set,
            Err(e) => {
                self.counters.failure();
                return Err(e);
            }
        };

        self.counters.fetch();
        let key = match self.derive(&key_set, kid) {
            Ok(key) => Arc::new(key),
            Err(e) => {
                self.counters.failure();
                warn!(kid = %kid, generation = key_set.generation(), error = %e, "No usable verification key");
                return Err(e);
            }
        };

        if self.store.insert(Arc::clone(&key), self.clock.now()) {
            debug!(kid = %kid, generation = key.generation, "Verification key cached");
        }
        Ok(key)
    }

    fn derive(&self, key_set: &KeySet, kid: &str) -> Result<VerificationKey> {
        if let Some(candidate) = key_set
            .find(kid)
            .find(|jwk| is_acceptable(jwk, self.algorithm))
        {
            return VerificationKey::from_jwk(candidate, self.algorithm, key_set.generation());
        }

        // The provider published this kid, but not in a form we can read.
        match key_set.find_rejected(kid).next() {
            Some(rejected) => Err(VerifyError::key_construction(
                kid,
                format!("published key is unreadable: {}", rejected.reason()),
            )),
            None => Err(VerifyError::UnknownKeyId(kid.to_string())),
        }
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether no key is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached key
    pub fn invalidate(&self) {
        self.store.reset();
    }

    /// The JWKS cache keys are derived from
    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

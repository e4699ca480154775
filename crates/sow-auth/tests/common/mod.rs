//! Common test utilities for integration tests
//!
//! Provides a scripted in-memory transport that counts upstream calls, fixture
//! signing keys with their published JWK form, token builders, and a wiremock
//! identity provider for end-to-end runs.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use parking_lot::Mutex;
use serde_json::{Value, json};
use sow_auth::{HttpTransport, ManualClock, TokenVerifier, TransportError, VerifierConfig};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

pub const PROVIDER: &str = "https://idp.test/realms/sow";
pub const DISCOVERY_URL: &str = "https://idp.test/realms/sow/.well-known/openid-configuration";
pub const JWKS_URL: &str = "https://idp.test/realms/sow/protocol/openid-connect/certs";
pub const AUDIENCE: &str = "sow-api";

pub const PRIMARY_KID: &str = "primary-2025";
pub const ROTATED_KID: &str = "rotated-2026";

pub const PRIMARY_PEM: &[u8] = include_bytes!("../fixtures/signing_key_primary.pem");
pub const ROTATED_PEM: &[u8] = include_bytes!("../fixtures/signing_key_rotated.pem");

pub const PRIMARY_MODULUS: &str = "qfOP2RtsraXRcGY6rKNfiPJN4X9WBhwlqhbZY_GaLuspH8aBSURtqTzYYrekf5ehhOencTRtPgtRt4GLjAZDO5_dda4C2LCutkagus2vUOP99ixktS-En9UlnHd2FVo31XD-UXBdC2PtoRpDAfjbTnrj1tl4Kg2gDDuTRH6wvhxgonwuVn-YD2MnDqUHPHSVqvuGcYbhiepd6N4mD5_k0CDqEPRo3ES2l-rKHyNruFZGbN_MuHAP8XyQFRtLBk71lyR2QADIvWtl-6ZqGEMMukDyP9UuXHGb4OIRy9OM-IX46kFzgCvjEesgw-RlmWZmaPolzh2eDLIBZ5rqSsxZTw";
pub const ROTATED_MODULUS: &str = "rBTUyNFLbPgVw6vZB17tbsoP58IRRIUomQKCy3-F8KovHi4BbOg5_Gcnov-rLqy-dcSFOpzOn1RzWTew2nAHe8cr5dmlT09qYe3GJZRrBkyD1Se9WnFfHpAHpGxMuI805mClVEa6BWGIWyzGR9ZFJc6FL6IsL_DsVTO9GozFZxhKN3gGLse2kICBP0ti6iL6AVAxu23BsNnskKMiB8rpUMW6u329dgfbSupmWAZ2mqEXJJXvN7n8-tOhdbJqMESFCcyhBIi6e21pGXiDdBs62s3ZX2ek_OnXqtWhhtIshPTqSf-qMEo13c5Kc0_z2NrQaC4zqpmN9L5wwHEezX1Dyw";

pub const TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
enum Scripted {
    Body(Vec<u8>),
    Status(u16),
    Unreachable,
}

/// In-memory transport with scripted responses and per-URL call counts
#[derive(Debug, Default)]
pub struct StubTransport {
    routes: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<HashMap<String, usize>>,
    offline: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
    panic_next: Mutex<bool>,
}

impl StubTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport already serving discovery and a JWKS with the primary key
    pub fn provider() -> Arc<Self> {
        let transport = Self::new();
        transport.respond_json(DISCOVERY_URL, discovery(JWKS_URL));
        transport.respond_json(JWKS_URL, jwks(vec![primary_jwk()]));
        transport
    }

    pub fn respond_json(&self, url: &str, body: Value) {
        self.respond_raw(url, &serde_json::to_vec(&body).unwrap());
    }

    pub fn respond_raw(&self, url: &str, body: &[u8]) {
        self.routes
            .lock()
            .insert(url.to_string(), Scripted::Body(body.to_vec()));
    }

    pub fn respond_status(&self, url: &str, status: u16) {
        self.routes
            .lock()
            .insert(url.to_string(), Scripted::Status(status));
    }

    pub fn fail(&self, url: &str) {
        self.routes
            .lock()
            .insert(url.to_string(), Scripted::Unreachable);
    }

    /// Make every URL unreachable (`true`) or restore the scripted routes
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    /// Delay every response, to keep fetches in flight
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Panic inside the next `get`, as a buggy transport would
    pub fn panic_once(&self) {
        *self.panic_next.lock() = true;
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl HttpTransport for StubTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        *self.calls.lock().entry(url.to_string()).or_insert(0) += 1;

        let panic_now = std::mem::take(&mut *self.panic_next.lock());
        if panic_now {
            panic!("transport bug while fetching {url}");
        }

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if *self.offline.lock() {
            return Err(TransportError::Request {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let scripted = self.routes.lock().get(url).cloned();
        match scripted {
            Some(Scripted::Body(body)) => Ok(body),
            Some(Scripted::Status(status)) => Err(TransportError::Status {
                url: url.to_string(),
                status,
            }),
            Some(Scripted::Unreachable) => Err(TransportError::Request {
                url: url.to_string(),
                reason: "operation timed out".to_string(),
            }),
            None => Err(TransportError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

pub fn config() -> VerifierConfig {
    VerifierConfig::new(PROVIDER).unwrap().with_audience(AUDIENCE)
}

/// Verifier over a stub transport and a manual clock
pub fn verifier_with(
    config: VerifierConfig,
    transport: &Arc<StubTransport>,
    clock: &Arc<ManualClock>,
) -> TokenVerifier {
    TokenVerifier::with_transport(
        config,
        Arc::clone(transport) as Arc<dyn HttpTransport>,
        Arc::clone(clock) as Arc<dyn sow_auth::Clock>,
    )
    .unwrap()
}

pub fn verifier(transport: &Arc<StubTransport>, clock: &Arc<ManualClock>) -> TokenVerifier {
    verifier_with(config(), transport, clock)
}

pub fn discovery(jwks_uri: &str) -> Value {
    json!({
        "issuer": PROVIDER,
        "jwks_uri": jwks_uri,
        "authorization_endpoint": format!("{PROVIDER}/protocol/openid-connect/auth"),
        "token_endpoint": format!("{PROVIDER}/protocol/openid-connect/token"),
        "id_token_signing_alg_values_supported": ["RS256"]
    })
}

pub fn rsa_jwk(kid: &str, modulus: &str) -> Value {
    json!({
        "kty": "RSA",
        "kid": kid,
        "use": "sig",
        "alg": "RS256",
        "n": modulus,
        "e": "AQAB"
    })
}

pub fn primary_jwk() -> Value {
    rsa_jwk(PRIMARY_KID, PRIMARY_MODULUS)
}

pub fn rotated_jwk() -> Value {
    rsa_jwk(ROTATED_KID, ROTATED_MODULUS)
}

pub fn jwks(keys: Vec<Value>) -> Value {
    json!({ "keys": keys })
}

/// Current Unix timestamp
pub fn current_timestamp() -> u64 {
    jsonwebtoken::get_current_timestamp()
}

/// Claims that pass every check of the default test configuration
pub fn valid_claims() -> Value {
    let now = current_timestamp();
    json!({
        "iss": PROVIDER,
        "aud": AUDIENCE,
        "sub": "f2a1c7de-6b7e-4b43-9a55-1b1f3c0e2d11",
        "preferred_username": "alice",
        "iat": now - 5,
        "exp": now + 600,
        "scope": "openid profile",
        "realm_access": { "roles": ["sow-reader"] }
    })
}

/// Sign `claims` with the given PEM key
pub fn sign_with(pem: &[u8], algorithm: Algorithm, kid: Option<&str>, claims: &Value) -> String {
    let mut header = Header::new(algorithm);
    header.kid = kid.map(str::to_string);
    let key = EncodingKey::from_rsa_pem(pem).expect("fixture key");
    encode(&header, claims, &key).expect("token signing")
}

/// RS256 token signed by the primary key
pub fn sign(claims: &Value) -> String {
    sign_with(PRIMARY_PEM, Algorithm::RS256, Some(PRIMARY_KID), claims)
}

/// RS256 token signed by the rotated key
pub fn sign_rotated(claims: &Value) -> String {
    sign_with(ROTATED_PEM, Algorithm::RS256, Some(ROTATED_KID), claims)
}

/// Mock identity provider serving discovery and JWKS over HTTP
pub struct MockIdentityProvider {
    pub server: MockServer,
    pub base_url: String,
    pub jwks_path: String,
}

impl MockIdentityProvider {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let base_url = format!("{}/realms/sow", server.uri());

        Self {
            server,
            base_url,
            jwks_path: "/realms/sow/protocol/openid-connect/certs".to_string(),
        }
    }

    pub fn jwks_url(&self) -> String {
        format!("{}{}", self.server.uri(), self.jwks_path)
    }

    /// Serve the discovery document and `keys`, expecting exactly `expected`
    /// calls to each endpoint
    pub async fn mock_provider(&self, keys: Vec<Value>, expected: u64) {
        let mut document = discovery(&self.jwks_url());
        document["issuer"] = json!(self.base_url);

        Mock::given(method("GET"))
            .and(path("/realms/sow/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(document))
            .expect(expected)
            .mount(&self.server)
            .await;

        Mock::given(method("GET"))
            .and(path(self.jwks_path.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks(keys)))
            .expect(expected)
            .mount(&self.server)
            .await;
    }

    /// Claims issued by this provider
    pub fn claims(&self) -> Value {
        let mut claims = valid_claims();
        claims["iss"] = json!(self.base_url);
        claims
    }
}

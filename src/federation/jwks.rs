//! Provider `id_token` verification with JWKS caching.
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Fetch the provider's JWKS (cached for 1 hour; refreshed once on unknown `kid`).
//! 3. Verify signature, `iss`, `aud` and `exp` with 60 seconds of leeway.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

/// Error variants for `id_token` verification failures.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// JWT decode / signature / claim validation failed.
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the provider's JWKS.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The header names an algorithm we do not accept from the provider.
    #[error("Unsupported JWT algorithm: {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    /// Network or HTTP error while fetching JWKS.
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Claims we read from a verified `id_token`.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer
    pub iss: String,
    /// Subject: the provider's stable user identifier
    pub sub: String,
    /// Expiry (validated by jsonwebtoken)
    pub exp: u64,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS cache, one entry per JWKS URI.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    ttl: Duration,
}

impl JwksCache {
    /// Create with the default 1-hour TTL.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_ttl(http, Duration::from_secs(3600))
    }

    /// Create with a custom TTL.
    #[must_use]
    pub fn with_ttl(http: reqwest::Client, ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            http,
            ttl,
        }
    }

    /// Return the cached JWKS for `jwks_uri`, fetching it if stale.
    ///
    /// If `force_refresh` is `true`, the cache is bypassed regardless of TTL.
    pub async fn get_or_fetch(&self, jwks_uri: &str, force_refresh: bool) -> Result<JwkSet, JwksError> {
        if !force_refresh {
            if let Some(cached) = self.inner.get(jwks_uri) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(jwks_uri = %jwks_uri, "Fetching JWKS");
        let jwks: JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.inner.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(jwks)
    }

    /// Verify a provider `id_token` and return its claims.
    pub async fn verify_id_token(
        &self,
        token: &str,
        jwks_uri: &str,
        issuer: &str,
        audience: &str,
    ) -> Result<IdTokenClaims, JwksError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.ok_or(JwksError::MissingKeyId)?;
        let validation = build_validation(header.alg, issuer, audience)?;
        let key = self.find_decoding_key(&kid, jwks_uri).await?;

        let data = jsonwebtoken::decode::<IdTokenClaims>(token, &key, &validation)?;
        Ok(data.claims)
    }

    async fn find_decoding_key(&self, kid: &str, jwks_uri: &str) -> Result<DecodingKey, JwksError> {
        let jwks = self.get_or_fetch(jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        // Unknown kid: the provider may have rotated keys. Refresh once.
        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.get_or_fetch(jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| JwksError::UnknownKeyId(kid.to_string()))
    }
}

/// Find a JWK by `kid` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks.find(kid)?;
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}

/// Only asymmetric algorithms are accepted; a provider token can never be
/// verified with an HMAC secret or without a signature.
fn build_validation(alg: Algorithm, issuer: &str, audience: &str) -> Result<Validation, JwksError> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => {}
        other => return Err(JwksError::UnsupportedAlgorithm(other)),
    }

    let mut v = Validation::new(alg);
    v.leeway = 60;
    v.set_issuer(&[issuer]);
    v.set_audience(&[audience]);
    v.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
    Ok(v)
}

//! Short-lived signed session assertions.
//!
//! An assertion binds the provider subject to a recovered account email and
//! rides in a cookie across the extra redirects of an interaction. It is
//! signed with the service's own asymmetric key pair; verification pins the
//! configured algorithm so unsigned or HMAC tokens are never accepted.

use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::{Error, Result};

/// Signing algorithm of the session key pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    #[default]
    #[serde(rename = "RS256")]
    Rs256,
    /// ECDSA P-256 with SHA-256
    #[serde(rename = "ES256")]
    Es256,
}

impl From<SigningAlgorithm> for Algorithm {
    fn from(alg: SigningAlgorithm) -> Self {
        match alg {
            SigningAlgorithm::Rs256 => Algorithm::RS256,
            SigningAlgorithm::Es256 => Algorithm::ES256,
        }
    }
}

/// Claims of a session assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionClaims {
    /// Provider subject
    pub subject: String,
    /// Recovered account email
    pub email: String,
    /// Issued at (epoch seconds)
    pub iat: i64,
    /// Expiry (epoch seconds)
    pub exp: i64,
    /// Token id
    pub jti: String,
}

/// Payload of a verified assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedAssertion {
    /// Provider subject
    pub subject: String,
    /// Recovered account email
    pub email: String,
}

/// Mints and verifies session assertions.
pub struct SessionSigner {
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    max_age: Duration,
}

impl SessionSigner {
    /// Load the key pair from PEM.
    ///
    /// RSA private keys may be PKCS#1 or PKCS#8; EC private keys must be PKCS#8.
    pub fn from_pem(
        algorithm: SigningAlgorithm,
        private_pem: &str,
        public_pem: &str,
        max_age: Duration,
    ) -> Result<Self> {
        let (encoding, decoding) = match algorithm {
            SigningAlgorithm::Rs256 => (
                EncodingKey::from_rsa_pem(private_pem.as_bytes()),
                DecodingKey::from_rsa_pem(public_pem.as_bytes()),
            ),
            SigningAlgorithm::Es256 => (
                EncodingKey::from_ec_pem(private_pem.as_bytes()),
                DecodingKey::from_ec_pem(public_pem.as_bytes()),
            ),
        };
        let encoding =
            encoding.map_err(|e| Error::Config(format!("invalid session private key: {e}")))?;
        let decoding =
            decoding.map_err(|e| Error::Config(format!("invalid session public key: {e}")))?;

        Ok(Self {
            algorithm: algorithm.into(),
            encoding,
            decoding,
            max_age,
        })
    }

    /// Default assertion lifetime (also the cookie max-age).
    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Mint an assertion valid for the default lifetime.
    pub fn mint(&self, subject: &str, email: &str) -> Result<String> {
        self.mint_with_ttl(subject, email, self.max_age)
    }

    /// Mint an assertion valid for `ttl`.
    pub fn mint_with_ttl(&self, subject: &str, email: &str, ttl: Duration) -> Result<String> {
        let iat = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            subject: subject.to_string(),
            email: email.to_string(),
            iat,
            exp: iat.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign session assertion: {e}")))
    }

    /// Verify a presented assertion.
    ///
    /// - no token: `MissingAssertion`
    /// - bad signature, wrong algorithm, malformed or expired: `VerificationFailed`
    /// - valid but lacking `subject`/`email`: `InvalidAssertion`
    pub fn verify(&self, token: Option<&str>) -> Result<VerifiedAssertion> {
        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => return Err(Error::MissingAssertion),
        };

        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        let data = jsonwebtoken::decode::<Value>(token, &self.decoding, &validation).map_err(|e| {
            error!(error = %e, action = "verify_assertion", "Failed to verify session assertion");
            Error::VerificationFailed(e.to_string())
        })?;

        let field = |name: &str| data.claims.get(name).and_then(Value::as_str).map(str::to_string);
        match (field("subject"), field("email")) {
            (Some(subject), Some(email)) => Ok(VerifiedAssertion { subject, email }),
            (subject, email) => {
                let keys: Vec<&String> = data
                    .claims
                    .as_object()
                    .map(|m| m.keys().collect())
                    .unwrap_or_default();
                debug!(
                    has_subject = subject.is_some(),
                    has_email = email.is_some(),
                    keys = ?keys,
                    "Session assertion has incorrect shape"
                );
                Err(Error::InvalidAssertion)
            }
        }
    }
}

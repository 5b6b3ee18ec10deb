//! OAuth `state` values carried through the provider redirect.
//!
//! Login state is positional and delimiter-joined:
//! `<interaction uid>,<iat hash>[,<email>]`. Fields are not escaped, so a
//! field containing the delimiter cannot be carried; such values are rejected
//! as `InvalidState` on the way back. The string itself is not signed. Only
//! the iat hash is keyed, and it is checked against the live interaction
//! when the callback is matched.
//!
//! Onboarding state is a bare random token and never contains the delimiter,
//! which is how a shared callback tells the two flows apart.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, KeyInit, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Field delimiter of login state.
pub const STATE_DELIMITER: char = ',';

type HmacSha256 = Hmac<Sha256>;

/// Decoded login state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginState {
    /// Interaction uid issued by the OIDC runtime
    pub interaction_uid: String,
    /// Keyed hash of the interaction's creation time
    pub interaction_iat_hash: String,
    /// Recovered account email, when known
    pub email: Option<String>,
}

impl LoginState {
    /// Build login state for an interaction.
    pub fn new(interaction_uid: impl Into<String>, interaction_iat_hash: impl Into<String>) -> Self {
        Self {
            interaction_uid: interaction_uid.into(),
            interaction_iat_hash: interaction_iat_hash.into(),
            email: None,
        }
    }

    /// Attach a recovered email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Serialize into the wire form.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = format!(
            "{}{STATE_DELIMITER}{}",
            self.interaction_uid, self.interaction_iat_hash
        );
        if let Some(email) = &self.email {
            out.push(STATE_DELIMITER);
            out.push_str(email);
        }
        out
    }

    /// Parse the wire form. Exactly two or three non-empty fields are accepted.
    pub fn parse(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split(STATE_DELIMITER).collect();
        if fields.iter().any(|f| f.is_empty()) {
            return Err(Error::InvalidState);
        }
        match fields.as_slice() {
            [uid, hash] => Ok(Self::new(*uid, *hash)),
            [uid, hash, email] => Ok(Self::new(*uid, *hash).with_email(*email)),
            _ => Err(Error::InvalidState),
        }
    }
}

/// State returned to the shared provider callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackState {
    /// Login flow
    Login(LoginState),
    /// Onboarding flow token
    Onboarding(String),
}

impl CallbackState {
    /// Classify by shape: delimited values are login state, bare tokens are
    /// onboarding state.
    pub fn classify(raw: &str) -> Result<Self> {
        if raw.contains(STATE_DELIMITER) {
            LoginState::parse(raw).map(Self::Login)
        } else {
            parse_onboarding_state(raw).map(Self::Onboarding)
        }
    }
}

/// Validate an onboarding token returned by the provider.
pub fn parse_onboarding_state(raw: &str) -> Result<String> {
    if raw.is_empty() || raw.contains(STATE_DELIMITER) {
        return Err(Error::InvalidState);
    }
    Ok(raw.to_string())
}

/// Generate an onboarding token: 16 random bytes, URL-safe base64.
#[must_use]
pub fn generate_onboarding_token() -> String {
    let bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Keyed hash over an interaction's creation time.
#[derive(Clone)]
pub struct InteractionHasher {
    key: Vec<u8>,
}

impl std::fmt::Debug for InteractionHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionHasher").finish_non_exhaustive()
    }
}

impl InteractionHasher {
    /// Create a hasher keyed by `secret`.
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config("state secret must not be empty".to_string()));
        }
        Ok(Self {
            key: secret.to_vec(),
        })
    }

    fn mac(&self) -> Result<HmacSha256> {
        <HmacSha256 as KeyInit>::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("HMAC key rejected: {e}")))
    }

    /// Hash the decimal `iat`.
    pub fn hash(&self, iat: i64) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(iat.to_string().as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes().as_slice()))
    }

    /// Check a returned hash against `iat` in constant time.
    pub fn verify(&self, iat: i64, candidate: &str) -> Result<bool> {
        let expected = self.hash(iat)?;
        Ok(expected.as_bytes().ct_eq(candidate.as_bytes()).into())
    }
}

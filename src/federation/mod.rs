//! Federated identity bridge to sgID.
//!
//! Drives one authentication attempt through
//! `Init -> AwaitingCallback -> ExchangingCode -> [FetchingUserInfo] -> Complete`:
//! build the redirect with an encoded `state`, decode the `state` that comes
//! back, exchange the code (single attempt) and, for onboarding, fetch the
//! profile. It also mints and verifies the session assertion cookie.

use std::time::Duration;

use tracing::warn;

use crate::config::Config;
use crate::{Error, Result};

mod assertion;
mod client;
mod jwks;
mod state;

pub use assertion::{AssertionClaims, SessionSigner, SigningAlgorithm, VerifiedAssertion};
pub use client::{SgidClient, TokenGrant, UserInfo};
pub use jwks::{IdTokenClaims, JwksCache, JwksError};
pub use state::{
    CallbackState, InteractionHasher, LoginState, STATE_DELIMITER, generate_onboarding_token,
    parse_onboarding_state,
};

/// sgID handshake plus session assertions.
pub struct FederatedIdentityBridge {
    client: SgidClient,
    hasher: InteractionHasher,
    signer: SessionSigner,
}

impl FederatedIdentityBridge {
    /// Assemble from parts.
    pub fn new(client: SgidClient, hasher: InteractionHasher, signer: SessionSigner) -> Self {
        Self {
            client,
            hasher,
            signer,
        }
    }

    /// Build from validated configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let signer = SessionSigner::from_pem(
            config.session.algorithm,
            &config.session.private_key,
            &config.session.public_key,
            config.session.max_age,
        )?;
        let hasher = InteractionHasher::new(config.state.secret.as_bytes())?;
        let client = SgidClient::new(config.sgid.clone())?;
        Ok(Self::new(client, hasher, signer))
    }

    /// Redirect for the login flow of interaction `uid` created at `iat`.
    ///
    /// Returns the URL and the state it carries.
    pub fn login_redirect(
        &self,
        interaction_uid: &str,
        iat: i64,
        email: Option<&str>,
    ) -> Result<(String, LoginState)> {
        let mut state = LoginState::new(interaction_uid, self.hasher.hash(iat)?);
        if let Some(email) = email {
            state = state.with_email(email);
        }
        let url = self.client.authorization_url(&state.encode())?;
        Ok((url, state))
    }

    /// Redirect for the onboarding flow carrying `token`.
    pub fn onboarding_redirect(&self, token: &str) -> Result<String> {
        self.client.authorization_url(token)
    }

    /// Check that `state` was issued for the interaction created at `iat`.
    pub fn verify_interaction(&self, state: &LoginState, iat: i64) -> Result<()> {
        if self.hasher.verify(iat, &state.interaction_iat_hash)? {
            Ok(())
        } else {
            warn!(
                interaction_uid = %state.interaction_uid,
                "Login state hash does not match interaction"
            );
            Err(Error::InvalidState)
        }
    }

    /// Exchange an authorization code for the subject and access token.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.client.exchange_code(code).await
    }

    /// Fetch profile attributes.
    pub async fn userinfo(&self, access_token: &str) -> Result<UserInfo> {
        self.client.userinfo(access_token).await
    }

    /// Mint a session assertion with the configured lifetime.
    pub fn mint_assertion(&self, subject: &str, email: &str) -> Result<String> {
        self.signer.mint(subject, email)
    }

    /// Mint a session assertion valid for `ttl`.
    pub fn mint_assertion_with_ttl(&self, subject: &str, email: &str, ttl: Duration) -> Result<String> {
        self.signer.mint_with_ttl(subject, email, ttl)
    }

    /// Verify a session assertion.
    pub fn verify_assertion(&self, token: Option<&str>) -> Result<VerifiedAssertion> {
        self.signer.verify(token)
    }

    /// Assertion lifetime (cookie max-age)
    #[must_use]
    pub fn assertion_max_age(&self) -> Duration {
        self.signer.max_age()
    }
}

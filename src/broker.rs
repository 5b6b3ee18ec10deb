//! Login and onboarding flows.
//!
//! The broker glues the persisted `Interaction` models, the account
//! directory and the sgID bridge together:
//!
//! - **Login**: an interaction asks for sgID; the callback maps the returned
//!   subject to a bound account and yields the interaction result the OIDC
//!   runtime finishes the interaction with.
//! - **Onboarding**: an email address gets a pending account and a mailed
//!   sgID link; the callback binds the sgID subject and profile to it.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::account::{Account, AccountDirectory};
use crate::federation::{
    FederatedIdentityBridge, LoginState, STATE_DELIMITER, VerifiedAssertion,
    generate_onboarding_token,
};
use crate::mailer::SignupMailer;
use crate::model::{OidcAdapter, Payload};
use crate::{Error, Result};

/// Outcome handed back to the OIDC runtime for an interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InteractionResult {
    /// The interaction's `login` prompt is satisfied.
    Login {
        /// Authenticated account
        login: LoginResult,
    },
    /// The interaction ends with an OAuth error.
    Error {
        /// OAuth error code
        error: String,
        /// Human-readable description
        error_description: String,
    },
}

/// `login` member of an [`InteractionResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    /// Account id (email)
    pub account_id: String,
}

impl InteractionResult {
    fn login(account_id: impl Into<String>) -> Self {
        Self::Login {
            login: LoginResult {
                account_id: account_id.into(),
            },
        }
    }

    fn access_denied(description: &str) -> Self {
        Self::Error {
            error: "access_denied".to_string(),
            error_description: description.to_string(),
        }
    }
}

/// Result of a completed login callback.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Interaction being finished
    pub interaction_uid: String,
    /// Result for the runtime
    pub result: InteractionResult,
    /// Session assertion, when an account was found
    pub assertion: Option<String>,
    /// Internal session id recorded on the account, when one was found
    pub sso_session_id: Option<String>,
}

/// Runs the login and onboarding flows.
pub struct Broker {
    interactions: Arc<dyn OidcAdapter>,
    accounts: Arc<AccountDirectory>,
    bridge: Arc<FederatedIdentityBridge>,
    mailer: Arc<dyn SignupMailer>,
}

impl Broker {
    /// Create a broker. `interactions` must be the adapter for the
    /// `Interaction` model.
    pub fn new(
        interactions: Arc<dyn OidcAdapter>,
        accounts: Arc<AccountDirectory>,
        bridge: Arc<FederatedIdentityBridge>,
        mailer: Arc<dyn SignupMailer>,
    ) -> Self {
        Self {
            interactions,
            accounts,
            bridge,
            mailer,
        }
    }

    /// Account directory
    #[must_use]
    pub fn accounts(&self) -> &Arc<AccountDirectory> {
        &self.accounts
    }

    async fn live_interaction(&self, uid: &str) -> Result<Option<(Payload, i64)>> {
        let Some(payload) = self.interactions.find(uid).await? else {
            return Ok(None);
        };
        let iat = payload
            .get("iat")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Internal(format!("interaction {uid} has no iat")))?;
        Ok(Some((payload, iat)))
    }

    /// Start sgID login for interaction `uid`; returns the redirect URL.
    pub async fn begin_login(&self, interaction_uid: &str) -> Result<String> {
        let (_, iat) = self
            .live_interaction(interaction_uid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Interaction {interaction_uid}")))?;
        let (url, _) = self.bridge.login_redirect(interaction_uid, iat, None)?;
        info!(interaction_uid = %interaction_uid, action = "begin_login", "Redirecting to sgID");
        Ok(url)
    }

    /// Finish sgID login.
    ///
    /// The state must name a live interaction whose creation-time hash
    /// matches; otherwise `InvalidState`. The code is exchanged exactly once.
    pub async fn complete_login(&self, code: &str, state: &LoginState) -> Result<LoginOutcome> {
        let uid = &state.interaction_uid;
        let Some((_, iat)) = self.live_interaction(uid).await? else {
            warn!(interaction_uid = %uid, "Login callback for unknown or expired interaction");
            return Err(Error::InvalidState);
        };
        self.bridge.verify_interaction(state, iat)?;

        let grant = self.bridge.exchange_code(code).await?;
        let account = self.accounts.resolve_by_subject(&grant.subject).await?;

        let outcome = match account {
            Some(account) => {
                let assertion = self.bridge.mint_assertion(&grant.subject, &account.email)?;
                let sso_session_id = uuid::Uuid::new_v4().to_string();
                self.accounts
                    .record_session(&account.email, &sso_session_id)
                    .await?;
                info!(
                    interaction_uid = %uid,
                    email = %account.email,
                    action = "complete_login",
                    "sgID login matched account"
                );
                LoginOutcome {
                    interaction_uid: uid.clone(),
                    result: InteractionResult::login(account.email),
                    assertion: Some(assertion),
                    sso_session_id: Some(sso_session_id),
                }
            }
            None => {
                info!(interaction_uid = %uid, action = "complete_login", "No account bound to sgID subject");
                LoginOutcome {
                    interaction_uid: uid.clone(),
                    result: InteractionResult::access_denied("No user found"),
                    assertion: None,
                    sso_session_id: None,
                }
            }
        };
        Ok(outcome)
    }

    /// Start onboarding for `email`: record a pending account and mail the
    /// sgID link.
    ///
    /// A pending account gets a fresh token; a bound account is a `Conflict`.
    pub async fn begin_onboarding(&self, email: &str) -> Result<()> {
        let email = normalize_email(email)?;
        let token = generate_onboarding_token();

        match self.accounts.resolve_by_email(&email).await {
            Ok(account) if account.is_bound() => {
                return Err(Error::Conflict(format!("account {email} is already registered")));
            }
            Ok(_) => {
                self.accounts.reissue_state(&email, &token).await?;
            }
            Err(Error::NotFound(_)) => {
                self.accounts.create(&email, &token).await?;
            }
            Err(e) => return Err(e),
        }

        let url = self.bridge.onboarding_redirect(&token)?;
        self.mailer.send_signup_link(&email, &url).await?;
        Ok(())
    }

    /// Finish onboarding: bind the sgID subject and profile to the pending
    /// account holding `token`.
    pub async fn complete_onboarding(&self, code: &str, token: &str) -> Result<Account> {
        let account = self
            .accounts
            .resolve_by_state(token)
            .await?
            .ok_or_else(|| Error::NotFound("Account for state".to_string()))?;

        let grant = self.bridge.exchange_code(code).await?;
        let info = self.bridge.userinfo(&grant.access_token).await?;
        if info.subject != grant.subject {
            return Err(Error::FetchUserInfo(
                "userinfo subject does not match id_token".to_string(),
            ));
        }

        self.accounts
            .bind(&account.email, &grant.subject, info.data)
            .await
    }

    /// Verify a session assertion cookie value.
    pub fn verify_session(&self, token: Option<&str>) -> Result<VerifiedAssertion> {
        self.bridge.verify_assertion(token)
    }
}

/// Trim and lowercase; reject values that are not plausibly an address.
fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_ascii_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
        }
        None => false,
    };
    // The email can ride in login state, which has no escaping.
    if !valid || email.contains(STATE_DELIMITER) || email.chars().any(char::is_whitespace) {
        return Err(Error::InvalidInput(format!("not an email address: {raw:?}")));
    }
    Ok(email)
}

//! Login and onboarding flow tests
//!
//! Drives the broker end to end over the in-process store and a mocked
//! sgID provider.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;
use ogpass::account::{AccountDirectory, NAME_ATTRIBUTE, account_table};
use ogpass::broker::{Broker, InteractionResult, LoginResult};
use ogpass::federation::{FederatedIdentityBridge, LoginState};
use ogpass::mailer::SignupMailer;
use ogpass::model::{ModelAdapter, OidcAdapter, model_table};
use ogpass::store::{KeyValueStore, MemoryStore};
use ogpass::{Error, Result};

const IAT: i64 = 1_700_000_000;

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMailer {
    fn last_token(&self) -> String {
        let sent = self.sent.lock();
        let (_, link) = sent.last().expect("a link was sent");
        state_of(link)
    }
}

#[async_trait::async_trait]
impl SignupMailer for RecordingMailer {
    async fn send_signup_link(&self, recipient: &str, link: &str) -> Result<()> {
        self.sent.lock().push((recipient.to_string(), link.to_string()));
        Ok(())
    }
}

fn state_of(url: &str) -> String {
    Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

struct Harness {
    interactions: Arc<ModelAdapter>,
    accounts: Arc<AccountDirectory>,
    mailer: Arc<RecordingMailer>,
    broker: Broker,
}

fn harness(provider_uri: &str) -> Harness {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let interactions = Arc::new(ModelAdapter::new(
        "Interaction",
        Arc::clone(&store),
        model_table(""),
        Duration::from_secs(300),
    ));
    let accounts = Arc::new(AccountDirectory::new(store, account_table("")));
    let bridge = Arc::new(FederatedIdentityBridge::from_config(&config(provider_uri)).unwrap());
    let mailer = Arc::new(RecordingMailer::default());
    let broker = Broker::new(
        interactions.clone(),
        accounts.clone(),
        bridge,
        mailer.clone(),
    );
    Harness {
        interactions,
        accounts,
        mailer,
        broker,
    }
}

impl Harness {
    async fn interaction(&self, uid: &str) {
        let payload = json!({"kind": "Interaction", "uid": uid, "iat": IAT});
        let serde_json::Value::Object(payload) = payload else {
            unreachable!()
        };
        self.interactions.upsert(uid, payload, Some(600)).await.unwrap();
    }

    async fn bound_account(&self, email: &str, sub: &str) {
        self.accounts.create(email, "seed-token").await.unwrap();
        self.accounts.bind(email, sub, BTreeMap::new()).await.unwrap();
    }

    async fn login_state(&self, uid: &str) -> LoginState {
        let url = self.broker.begin_login(uid).await.unwrap();
        LoginState::parse(&state_of(&url)).unwrap()
    }
}

// -- login --

#[tokio::test]
async fn login_with_bound_subject_yields_account_and_assertion() {
    // GIVEN: a live interaction and an account bound to sub-1
    let server = provider("good-code", "sub-1", "ALICE TAN").await;
    let h = harness(&server.uri());
    h.interaction("u-1").await;
    h.bound_account("alice@agency.gov.sg", "sub-1").await;

    // WHEN: the provider calls back with the state from begin_login
    let state = h.login_state("u-1").await;
    let outcome = h.broker.complete_login("good-code", &state).await.unwrap();

    // THEN: the interaction finishes as alice and a session assertion is minted
    assert_eq!(outcome.interaction_uid, "u-1");
    assert_eq!(
        outcome.result,
        InteractionResult::Login {
            login: LoginResult {
                account_id: "alice@agency.gov.sg".to_string()
            }
        }
    );
    let verified = h
        .broker
        .verify_session(outcome.assertion.as_deref())
        .unwrap();
    assert_eq!(verified.subject, "sub-1");
    assert_eq!(verified.email, "alice@agency.gov.sg");

    // AND: the internal session id is recorded on the account
    let account = h.accounts.resolve_by_email("alice@agency.gov.sg").await.unwrap();
    assert!(outcome.sso_session_id.is_some());
    assert_eq!(account.sso_session_id, outcome.sso_session_id);
}

#[tokio::test]
async fn login_with_unknown_subject_is_access_denied() {
    let server = provider("good-code", "sub-unbound", "NOBODY").await;
    let h = harness(&server.uri());
    h.interaction("u-2").await;

    let state = h.login_state("u-2").await;
    let outcome = h.broker.complete_login("good-code", &state).await.unwrap();

    assert!(outcome.assertion.is_none());
    assert!(outcome.sso_session_id.is_none());
    assert_eq!(
        serde_json::to_value(&outcome.result).unwrap(),
        json!({"error": "access_denied", "error_description": "No user found"})
    );
}

/// Provider whose token endpoint must never be hit.
async fn untouchable_provider() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn tampered_state_is_rejected_before_code_exchange() {
    // GIVEN: valid state for u-3 whose hash was altered
    let server = untouchable_provider().await;
    let h = harness(&server.uri());
    h.interaction("u-3").await;
    let mut state = h.login_state("u-3").await;
    state.interaction_iat_hash = "forged".to_string();

    // THEN: InvalidState, and the code is never exchanged (verified on drop)
    let err = h.broker.complete_login("code", &state).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState));
}

#[tokio::test]
async fn state_for_vanished_interaction_is_rejected() {
    // GIVEN: state issued for an interaction that is then destroyed
    let server = untouchable_provider().await;
    let h = harness(&server.uri());
    h.interaction("u-4").await;
    let state = h.login_state("u-4").await;
    h.interactions.destroy("u-4").await.unwrap();

    let err = h.broker.complete_login("code", &state).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState));
}

#[tokio::test]
async fn begin_login_for_unknown_interaction_is_not_found() {
    let h = harness("https://api.id.gov.sg");
    let err = h.broker.begin_login("missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// -- onboarding --

#[tokio::test]
async fn onboarding_binds_subject_and_profile() {
    // GIVEN: a provider that signs in sub-7 named ALICE TAN
    let server = provider("good-code", "sub-7", "ALICE TAN").await;
    let h = harness(&server.uri());

    // WHEN: alice signs up and completes the mailed link
    h.broker
        .begin_onboarding("  Alice@Agency.gov.sg ")
        .await
        .unwrap();
    let (recipient, _) = h.mailer.sent.lock()[0].clone();
    assert_eq!(recipient, "alice@agency.gov.sg");
    let token = h.mailer.last_token();
    let account = h
        .broker
        .complete_onboarding("good-code", &token)
        .await
        .unwrap();

    // THEN: the account is bound, carries the name, and the token is spent
    assert_eq!(account.sub.as_deref(), Some("sub-7"));
    assert_eq!(
        account.attributes.get(NAME_ATTRIBUTE).map(String::as_str),
        Some("ALICE TAN")
    );
    assert!(h.accounts.resolve_by_state(&token).await.unwrap().is_none());
    assert_eq!(
        h.accounts
            .resolve_by_subject("sub-7")
            .await
            .unwrap()
            .unwrap()
            .email,
        "alice@agency.gov.sg"
    );
}

#[tokio::test]
async fn repeated_signup_reissues_the_token() {
    let h = harness("https://api.id.gov.sg");
    h.broker.begin_onboarding("bob@agency.gov.sg").await.unwrap();
    let first = h.mailer.last_token();
    h.broker.begin_onboarding("bob@agency.gov.sg").await.unwrap();
    let second = h.mailer.last_token();

    assert_ne!(first, second);
    assert!(h.accounts.resolve_by_state(&first).await.unwrap().is_none());
    assert!(h.accounts.resolve_by_state(&second).await.unwrap().is_some());
}

#[tokio::test]
async fn signup_for_bound_account_conflicts() {
    let h = harness("https://api.id.gov.sg");
    h.bound_account("carol@agency.gov.sg", "sub-c").await;

    let err = h
        .broker
        .begin_onboarding("carol@agency.gov.sg")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert!(h.mailer.sent.lock().is_empty());
}

#[tokio::test]
async fn signup_with_malformed_email_is_rejected() {
    let h = harness("https://api.id.gov.sg");
    let err = h.broker.begin_onboarding("not-an-email").await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn onboarding_with_unknown_token_is_not_found() {
    let server = untouchable_provider().await;
    let h = harness(&server.uri());

    let err = h
        .broker
        .complete_onboarding("code", "never-issued")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn userinfo_for_another_subject_is_rejected() {
    // GIVEN: a provider whose userinfo disagrees with the id_token subject
    let server = MockServer::start().await;
    mount_jwks(&server).await;
    mount_token(&server, "code", &id_token(PROVIDER_KID, &id_claims(&server.uri(), "sub-1"))).await;
    mount_userinfo(&server, "sub-2", json!({"myinfo.name": "EVE"})).await;
    let h = harness(&server.uri());
    h.broker.begin_onboarding("dave@agency.gov.sg").await.unwrap();
    let token = h.mailer.last_token();

    // THEN: nothing is bound
    let err = h.broker.complete_onboarding("code", &token).await.unwrap_err();
    assert!(matches!(err, Error::FetchUserInfo(_)));
    assert!(h.accounts.resolve_by_state(&token).await.unwrap().is_some());
}

#[tokio::test]
async fn subject_already_bound_elsewhere_conflicts() {
    let server = provider("good-code", "sub-taken", "ERIN").await;
    let h = harness(&server.uri());
    h.bound_account("first@agency.gov.sg", "sub-taken").await;
    h.broker.begin_onboarding("second@agency.gov.sg").await.unwrap();
    let token = h.mailer.last_token();

    let err = h
        .broker
        .complete_onboarding("good-code", &token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

//! sgID bridge tests against a mocked provider
//!
//! Covers:
//! - Authorization redirects and login state round-trips
//! - Code exchange with `id_token` verification
//! - Userinfo projection
//! - Session assertion mint/verify

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use pretty_assertions::assert_eq;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;
use ogpass::Error;
use ogpass::federation::{
    CallbackState, FederatedIdentityBridge, InteractionHasher, SessionSigner, SgidClient,
    SigningAlgorithm,
};

fn bridge(provider_uri: &str) -> FederatedIdentityBridge {
    FederatedIdentityBridge::from_config(&config(provider_uri)).unwrap()
}

fn query(url: &str) -> BTreeMap<String, String> {
    Url::parse(url).unwrap().query_pairs().into_owned().collect()
}

// -- redirects and state --

#[test]
fn login_redirect_carries_state_that_decodes_back() {
    // GIVEN: a bridge for a provider
    let bridge = bridge("https://api.id.gov.sg");

    // WHEN: a login redirect is built for interaction u-1 created at iat
    let (url, state) = bridge
        .login_redirect("u-1", 1_700_000_000, Some("alice@agency.gov.sg"))
        .unwrap();

    // THEN: the URL targets the authorize endpoint with every OAuth parameter
    assert!(url.starts_with("https://api.id.gov.sg/v1/oauth/authorize?"));
    let params = query(&url);
    assert_eq!(params["response_type"], "code");
    assert_eq!(params["client_id"], CLIENT_ID);
    assert_eq!(params["scope"], "openid myinfo.name");
    assert_eq!(params["redirect_uri"], "https://ogpass.example/sgid/callback");

    // AND: the returned state classifies as login state with the same fields
    match CallbackState::classify(&params["state"]).unwrap() {
        CallbackState::Login(decoded) => {
            assert_eq!(decoded, state);
            assert_eq!(decoded.interaction_uid, "u-1");
            assert_eq!(decoded.email.as_deref(), Some("alice@agency.gov.sg"));
        }
        CallbackState::Onboarding(_) => panic!("expected login state"),
    }
    bridge.verify_interaction(&state, 1_700_000_000).unwrap();
}

#[test]
fn state_for_a_different_interaction_time_is_rejected() {
    let bridge = bridge("https://api.id.gov.sg");
    let (_, state) = bridge.login_redirect("u-1", 1_700_000_000, None).unwrap();

    let err = bridge.verify_interaction(&state, 1_700_000_999).unwrap_err();
    assert!(matches!(err, Error::InvalidState));
}

#[test]
fn state_hash_from_another_secret_is_rejected() {
    // GIVEN: state minted by a deployment with a different secret
    let bridge = bridge("https://api.id.gov.sg");
    let foreign = InteractionHasher::new(b"someone-else").unwrap();
    let forged = ogpass::federation::LoginState::new("u-1", foreign.hash(42).unwrap());

    // THEN: it does not verify against the same interaction
    assert!(matches!(
        bridge.verify_interaction(&forged, 42),
        Err(Error::InvalidState)
    ));
}

#[test]
fn onboarding_redirect_carries_bare_token() {
    let bridge = bridge("https://api.id.gov.sg");
    let url = bridge.onboarding_redirect("tok-123").unwrap();
    assert_eq!(query(&url)["state"], "tok-123");
}

#[test]
fn unparseable_endpoint_fails_redirect() {
    let bridge = bridge("not a url");
    assert!(matches!(
        bridge.onboarding_redirect("tok"),
        Err(Error::CreateRedirectUrl(_))
    ));
}

// -- code exchange --

#[tokio::test]
async fn code_exchange_returns_verified_subject() {
    // GIVEN: a provider that signs in sub-1 for good-code
    let server = provider("good-code", "sub-1", "ALICE TAN").await;
    let bridge = bridge(&server.uri());

    // WHEN: the code is exchanged
    let grant = bridge.exchange_code("good-code").await.unwrap();

    // THEN: the subject comes from the verified id_token
    assert_eq!(grant.subject, "sub-1");
    assert_eq!(grant.access_token, ACCESS_TOKEN);
}

#[tokio::test]
async fn rejected_code_is_a_token_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .expect(1)
        .mount(&server)
        .await;
    let bridge = bridge(&server.uri());

    let err = bridge.exchange_code("used-code").await.unwrap_err();
    assert!(matches!(err, Error::FetchAccessToken(_)));
    assert_eq!(err.code(), "fetch_access_token_error");
}

#[tokio::test]
async fn id_token_for_another_client_is_rejected() {
    // GIVEN: an id_token minted for a different audience
    let server = MockServer::start().await;
    let mut claims = id_claims(&server.uri(), "sub-1");
    claims["aud"] = json!("someone-else");
    mount_jwks(&server).await;
    mount_token(&server, "code", &id_token(PROVIDER_KID, &claims)).await;

    // THEN: the exchange fails
    let err = bridge(&server.uri()).exchange_code("code").await.unwrap_err();
    assert!(matches!(err, Error::FetchAccessToken(_)));
}

#[tokio::test]
async fn id_token_from_another_issuer_is_rejected() {
    let server = MockServer::start().await;
    let claims = id_claims("https://evil.example", "sub-1");
    mount_jwks(&server).await;
    mount_token(&server, "code", &id_token(PROVIDER_KID, &claims)).await;

    let err = bridge(&server.uri()).exchange_code("code").await.unwrap_err();
    assert!(matches!(err, Error::FetchAccessToken(_)));
}

#[tokio::test]
async fn unknown_kid_refreshes_jwks_once_then_fails() {
    // GIVEN: an id_token signed under a kid the JWKS does not list
    let server = MockServer::start().await;
    let jwks: serde_json::Value = serde_json::from_str(JWKS).unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/oauth/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks))
        .expect(2)
        .mount(&server)
        .await;
    let claims = id_claims(&server.uri(), "sub-1");
    mount_token(&server, "code", &id_token("rotated-key", &claims)).await;

    // WHEN / THEN: the exchange fails after one forced refresh (verified on drop)
    let err = bridge(&server.uri()).exchange_code("code").await.unwrap_err();
    assert!(matches!(err, Error::FetchAccessToken(_)));
}

#[tokio::test]
async fn token_response_without_id_token_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "at"})))
        .mount(&server)
        .await;

    let err = bridge(&server.uri()).exchange_code("code").await.unwrap_err();
    assert!(matches!(err, Error::FetchAccessToken(_)));
}

// -- userinfo --

#[tokio::test]
async fn userinfo_keeps_only_requested_attributes() {
    // GIVEN: a provider returning more attributes than were requested
    let server = MockServer::start().await;
    mount_userinfo(
        &server,
        "sub-1",
        json!({"myinfo.name": "ALICE TAN", "myinfo.sex": "F"}),
    )
    .await;

    // WHEN: userinfo is fetched
    let info = bridge(&server.uri()).userinfo(ACCESS_TOKEN).await.unwrap();

    // THEN: only myinfo.name survives
    assert_eq!(info.subject, "sub-1");
    assert_eq!(
        info.data,
        BTreeMap::from([("myinfo.name".to_string(), "ALICE TAN".to_string())])
    );
}

#[tokio::test]
async fn userinfo_rejection_is_a_userinfo_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/oauth/userinfo"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = bridge(&server.uri()).userinfo("expired").await.unwrap_err();
    assert!(matches!(err, Error::FetchUserInfo(_)));
}

#[tokio::test]
async fn client_can_be_used_directly() {
    let server = provider("c", "sub-9", "BOB").await;
    let client = SgidClient::new(sgid_config(&server.uri())).unwrap();

    let grant = client.exchange_code("c").await.unwrap();
    let info = client.userinfo(&grant.access_token).await.unwrap();
    assert_eq!(info.subject, grant.subject);
}

// -- session assertions --

#[test]
fn assertion_round_trips_through_bridge() {
    let bridge = bridge("https://api.id.gov.sg");
    let token = bridge.mint_assertion("sub-1", "alice@agency.gov.sg").unwrap();

    let verified = bridge.verify_assertion(Some(&token)).unwrap();
    assert_eq!(verified.subject, "sub-1");
    assert_eq!(verified.email, "alice@agency.gov.sg");
    assert_eq!(bridge.assertion_max_age(), Duration::from_secs(3600));
}

#[tokio::test]
async fn assertion_expires() {
    // GIVEN: an assertion valid for one second
    let bridge = bridge("https://api.id.gov.sg");
    let token = bridge
        .mint_assertion_with_ttl("sub-1", "alice@agency.gov.sg", Duration::from_secs(1))
        .unwrap();

    // WHEN: two seconds pass
    tokio::time::sleep(Duration::from_secs(2)).await;

    // THEN: verification fails
    assert!(matches!(
        bridge.verify_assertion(Some(&token)),
        Err(Error::VerificationFailed(_))
    ));
}

#[test]
fn absent_assertion_is_missing() {
    let bridge = bridge("https://api.id.gov.sg");
    assert!(matches!(bridge.verify_assertion(None), Err(Error::MissingAssertion)));
    assert!(matches!(bridge.verify_assertion(Some("")), Err(Error::MissingAssertion)));
}

#[test]
fn unsigned_assertion_is_rejected() {
    // GIVEN: a hand-built token with alg=none
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let exp = chrono::Utc::now().timestamp() + 600;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        json!({"subject": "sub-1", "email": "mallory@agency.gov.sg", "exp": exp})
            .to_string()
            .as_bytes(),
    );
    let token = format!("{header}.{claims}.");

    // THEN: it never verifies
    let bridge = bridge("https://api.id.gov.sg");
    assert!(matches!(
        bridge.verify_assertion(Some(&token)),
        Err(Error::VerificationFailed(_))
    ));
}

#[test]
fn assertion_signed_by_another_key_is_rejected() {
    // GIVEN: a well-formed RS256 token signed with the provider's key
    let exp = chrono::Utc::now().timestamp() + 600;
    let key = EncodingKey::from_rsa_pem(PROVIDER_PRIVATE.as_bytes()).unwrap();
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::RS256),
        &json!({"subject": "sub-1", "email": "alice@agency.gov.sg", "exp": exp}),
        &key,
    )
    .unwrap();

    let bridge = bridge("https://api.id.gov.sg");
    assert!(matches!(
        bridge.verify_assertion(Some(&token)),
        Err(Error::VerificationFailed(_))
    ));
}

#[test]
fn assertion_without_email_is_invalid() {
    // GIVEN: a correctly signed token lacking the email claim
    let exp = chrono::Utc::now().timestamp() + 600;
    let key = EncodingKey::from_rsa_pem(ASSERTION_PRIVATE.as_bytes()).unwrap();
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::RS256),
        &json!({"subject": "sub-1", "exp": exp}),
        &key,
    )
    .unwrap();

    let bridge = bridge("https://api.id.gov.sg");
    assert!(matches!(
        bridge.verify_assertion(Some(&token)),
        Err(Error::InvalidAssertion)
    ));
}

#[test]
fn es256_key_pair_is_supported() {
    let signer = SessionSigner::from_pem(
        SigningAlgorithm::Es256,
        include_str!("fixtures/ec_private.pem"),
        include_str!("fixtures/ec_public.pem"),
        Duration::from_secs(60),
    )
    .unwrap();
    let token = signer.mint("sub-1", "alice@agency.gov.sg").unwrap();
    assert_eq!(signer.verify(Some(&token)).unwrap().subject, "sub-1");
}

#[test]
fn mismatched_key_material_is_a_config_error() {
    let err = SessionSigner::from_pem(
        SigningAlgorithm::Es256,
        ASSERTION_PRIVATE,
        ASSERTION_PUBLIC,
        Duration::from_secs(60),
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::Config(_)));
}

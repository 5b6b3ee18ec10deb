//! Shared fixtures: a mocked sgID provider and matching configuration.

#![allow(dead_code)]

use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ogpass::config::{Config, SessionConfig, SgidConfig, StateConfig};
use ogpass::federation::SigningAlgorithm;

pub const CLIENT_ID: &str = "ogpass-test";
pub const CLIENT_SECRET: &str = "ogpass-test-secret";
pub const PROVIDER_KID: &str = "sgid-test-key";
pub const ACCESS_TOKEN: &str = "access-token-1";

pub const PROVIDER_PRIVATE: &str = include_str!("../fixtures/provider_private.pem");
pub const ASSERTION_PRIVATE: &str = include_str!("../fixtures/assertion_private.pem");
pub const ASSERTION_PUBLIC: &str = include_str!("../fixtures/assertion_public.pem");
pub const JWKS: &str = include_str!("../fixtures/provider_jwks.json");

pub fn sgid_config(provider_uri: &str) -> SgidConfig {
    SgidConfig {
        client_id: CLIENT_ID.to_string(),
        client_secret: CLIENT_SECRET.to_string(),
        auth_endpoint: provider_uri.to_string(),
        redirect_uri: "https://ogpass.example/sgid/callback".to_string(),
        request_timeout: Duration::from_secs(5),
        ..SgidConfig::default()
    }
}

pub fn config(provider_uri: &str) -> Config {
    Config {
        sgid: sgid_config(provider_uri),
        session: SessionConfig {
            private_key: ASSERTION_PRIVATE.to_string(),
            public_key: ASSERTION_PUBLIC.to_string(),
            algorithm: SigningAlgorithm::Rs256,
            ..SessionConfig::default()
        },
        state: StateConfig {
            secret: "interaction-secret".to_string(),
        },
        ..Config::default()
    }
}

/// Sign an `id_token` with the provider key.
pub fn id_token(kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(PROVIDER_PRIVATE.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

/// Claims the provider issues for `sub`, valid for five minutes.
pub fn id_claims(issuer: &str, sub: &str) -> Value {
    let now = chrono::Utc::now().timestamp();
    json!({
        "iss": issuer,
        "sub": sub,
        "aud": CLIENT_ID,
        "iat": now,
        "exp": now + 300,
    })
}

pub async fn mount_jwks(server: &MockServer) {
    let jwks: Value = serde_json::from_str(JWKS).unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/oauth/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks))
        .mount(server)
        .await;
}

/// Token endpoint accepting `code` and answering with `id_token`.
pub async fn mount_token(server: &MockServer, code: &str, id_token: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_string_contains(format!("code={code}")))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains(format!("client_secret={CLIENT_SECRET}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": ACCESS_TOKEN,
            "token_type": "Bearer",
            "expires_in": 300,
            "id_token": id_token,
        })))
        .mount(server)
        .await;
}

pub async fn mount_userinfo(server: &MockServer, sub: &str, data: Value) {
    Mock::given(method("GET"))
        .and(path("/v1/oauth/userinfo"))
        .and(header("authorization", format!("Bearer {ACCESS_TOKEN}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": sub,
            "key": "unused",
            "data": data,
        })))
        .mount(server)
        .await;
}

/// Provider that signs in `sub` for `code` and reports `name`.
pub async fn provider(code: &str, sub: &str, name: &str) -> MockServer {
    let server = MockServer::start().await;
    let token = id_token(PROVIDER_KID, &id_claims(&server.uri(), sub));
    mount_jwks(&server).await;
    mount_token(&server, code, &token).await;
    mount_userinfo(&server, sub, json!({"myinfo.name": name})).await;
    server
}

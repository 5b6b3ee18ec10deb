//! sgID OAuth 2.0 / OIDC client.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use super::jwks::JwksCache;
use crate::config::SgidConfig;
use crate::{Error, Result};

/// Result of a successful code exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Provider subject (from the verified `id_token`)
    pub subject: String,
    /// Access token for the userinfo endpoint
    pub access_token: String,
}

/// Profile attributes returned by the userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// Provider subject
    pub subject: String,
    /// Requested attributes, keyed by scope name (e.g. `myinfo.name`)
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    sub: String,
    #[serde(default)]
    data: HashMap<String, String>,
}

/// HTTP client for the sgID endpoints.
pub struct SgidClient {
    http: reqwest::Client,
    config: SgidConfig,
    jwks: Arc<JwksCache>,
}

impl SgidClient {
    /// Create a client for `config`.
    pub fn new(config: SgidConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        let jwks = Arc::new(JwksCache::new(http.clone()));
        Ok(Self { http, config, jwks })
    }

    /// Build the authorization redirect carrying `state`.
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        let endpoint = format!("{}/authorize", self.config.endpoint());
        let mut url = Url::parse(&endpoint).map_err(|e| {
            error!(endpoint = %endpoint, error = %e, action = "create_redirect_url", "Invalid authorization endpoint");
            Error::CreateRedirectUrl(e.to_string())
        })?;

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scope())
            .append_pair("state", state);

        Ok(url.to_string())
    }

    /// Exchange an authorization code for the subject and an access token.
    ///
    /// Single attempt: authorization codes are single-use.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        let token_endpoint = format!("{}/token", self.config.endpoint());
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| fetch_token_error(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(fetch_token_error(format!(
                "Token exchange failed: HTTP {status} - {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| fetch_token_error(format!("Failed to parse token response: {e}")))?;
        let id_token = token
            .id_token
            .ok_or_else(|| fetch_token_error("Token response has no id_token".to_string()))?;

        let claims = self
            .jwks
            .verify_id_token(
                &id_token,
                &self.config.jwks_uri(),
                &self.config.issuer(),
                &self.config.client_id,
            )
            .await
            .map_err(|e| fetch_token_error(format!("id_token rejected: {e}")))?;

        debug!("Exchanged authorization code with sgID");
        Ok(TokenGrant {
            subject: claims.sub,
            access_token: token.access_token,
        })
    }

    /// Fetch the requested profile attributes.
    pub async fn userinfo(&self, access_token: &str) -> Result<UserInfo> {
        let endpoint = format!("{}/userinfo", self.config.endpoint());
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| fetch_userinfo_error(format!("Userinfo request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(fetch_userinfo_error(format!(
                "Userinfo failed: HTTP {status} - {body}"
            )));
        }

        let info: UserInfoResponse = response
            .json()
            .await
            .map_err(|e| fetch_userinfo_error(format!("Failed to parse userinfo: {e}")))?;

        let mut data = info.data;
        let projected = self
            .config
            .attribute_scopes()
            .filter_map(|scope| data.remove_entry(scope))
            .collect();

        Ok(UserInfo {
            subject: info.sub,
            data: projected,
        })
    }
}

fn fetch_token_error(detail: String) -> Error {
    error!(detail = %detail, action = "token", "Failed to retrieve access token from sgID");
    Error::FetchAccessToken(detail)
}

fn fetch_userinfo_error(detail: String) -> Error {
    error!(detail = %detail, action = "userinfo", "Failed to retrieve user info from sgID");
    Error::FetchUserInfo(detail)
}

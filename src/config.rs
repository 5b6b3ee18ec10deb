//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::federation::SigningAlgorithm;
use crate::{Error, Result};

const REDACTED: &str = "<redacted>";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP server
    pub server: ServerConfig,
    /// Persistence backend
    pub store: StoreConfig,
    /// sgID client
    pub sgid: SgidConfig,
    /// Session assertions
    pub session: SessionConfig,
    /// Login state hashing
    pub state: StateConfig,
    /// Model lifetimes
    pub ttl: TtlConfig,
}

impl Config {
    /// Load configuration from an optional YAML file and `OGPASS_` environment
    /// variables (nested keys split on `__`, e.g. `OGPASS_SGID__CLIENT_ID`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("OGPASS_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be loaded before ${VAR} expansion
        config.load_env_files();
        config.expand_env_vars()?;
        config.normalize_keys();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in secrets and key material
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for value in [
            &mut self.sgid.client_id,
            &mut self.sgid.client_secret,
            &mut self.session.private_key,
            &mut self.session.public_key,
            &mut self.state.secret,
        ] {
            *value = expand_string(&re, value);
        }
        Ok(())
    }

    /// PEM values passed through single-line env vars carry literal `\n`.
    fn normalize_keys(&mut self) {
        for pem in [&mut self.session.private_key, &mut self.session.public_key] {
            if pem.contains("\\n") {
                *pem = pem.replace("\\n", "\n");
            }
        }
    }

    /// Fail fast on missing secrets or unusable endpoints.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("sgid.client_id", &self.sgid.client_id),
            ("sgid.client_secret", &self.sgid.client_secret),
            ("sgid.redirect_uri", &self.sgid.redirect_uri),
            ("session.private_key", &self.session.private_key),
            ("session.public_key", &self.session.public_key),
            ("state.secret", &self.state.secret),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }

        for (name, value) in [
            ("sgid.auth_endpoint", &self.sgid.auth_endpoint),
            ("sgid.redirect_uri", &self.sgid.redirect_uri),
        ] {
            Url::parse(value).map_err(|e| Error::Config(format!("{name} is not a URL: {e}")))?;
        }

        let zero: Vec<&str> = [
            ("server.request_timeout", self.server.request_timeout),
            ("store.reaper_interval", self.store.reaper_interval),
            ("sgid.request_timeout", self.sgid.request_timeout),
            ("session.max_age", self.session.max_age),
        ]
        .iter()
        .filter(|(_, value)| value.is_zero())
        .map(|(name, _)| *name)
        .collect();
        if !zero.is_empty() {
            return Err(Error::Config(format!(
                "durations must be positive: {}",
                zero.join(", ")
            )));
        }

        if self.store.backend == StoreBackend::Dynamodb && !cfg!(feature = "dynamodb") {
            return Err(Error::Config(
                "store.backend is dynamodb but this build lacks the `dynamodb` feature".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy with secrets replaced, for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for secret in [
            &mut config.sgid.client_secret,
            &mut config.session.private_key,
            &mut config.state.secret,
        ] {
            if !secret.is_empty() {
                *secret = REDACTED.to_string();
            }
        }
        config
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Persistence backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store
    #[default]
    Memory,
    /// Amazon `DynamoDB` (requires the `dynamodb` feature)
    Dynamodb,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend
    pub backend: StoreBackend,
    /// Prefix prepended to every table name
    pub table_prefix: String,
    /// AWS region override
    pub region: Option<String>,
    /// Endpoint override (local `DynamoDB`)
    pub endpoint: Option<String>,
    /// How often the in-memory reaper runs
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
    /// How long the in-memory store retains expired rows
    #[serde(with = "humantime_serde")]
    pub reclaim_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            table_prefix: String::new(),
            region: None,
            endpoint: None,
            reaper_interval: Duration::from_secs(60),
            reclaim_delay: Duration::from_secs(48 * 3600),
        }
    }
}

/// sgID client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SgidConfig {
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Base URL; OAuth endpoints live under `/v1/oauth`
    pub auth_endpoint: String,
    /// Callback registered with sgID
    pub redirect_uri: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Expected `id_token` issuer (defaults to `auth_endpoint`)
    pub issuer: Option<String>,
    /// JWKS location (defaults to `<endpoint>/jwks`)
    pub jwks_uri: Option<String>,
    /// Timeout for each sgID request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for SgidConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            auth_endpoint: "https://api.id.gov.sg".to_string(),
            redirect_uri: String::new(),
            scopes: vec!["openid".to_string(), "myinfo.name".to_string()],
            issuer: None,
            jwks_uri: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl SgidConfig {
    /// OAuth endpoint root
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/v1/oauth", self.auth_endpoint.trim_end_matches('/'))
    }

    /// Expected `id_token` issuer
    #[must_use]
    pub fn issuer(&self) -> String {
        self.issuer
            .clone()
            .unwrap_or_else(|| self.auth_endpoint.trim_end_matches('/').to_string())
    }

    /// JWKS location
    #[must_use]
    pub fn jwks_uri(&self) -> String {
        self.jwks_uri
            .clone()
            .unwrap_or_else(|| format!("{}/jwks", self.endpoint()))
    }

    /// Space-separated scope parameter
    #[must_use]
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// Scopes naming profile attributes (everything except `openid`)
    pub fn attribute_scopes(&self) -> impl Iterator<Item = &str> {
        self.scopes
            .iter()
            .map(String::as_str)
            .filter(|s| *s != "openid")
    }
}

/// Session assertion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// PEM private key
    pub private_key: String,
    /// PEM public key
    pub public_key: String,
    /// Signature algorithm matching the key pair
    pub algorithm: SigningAlgorithm,
    /// Assertion lifetime and cookie max-age
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Cookie carrying the assertion
    pub cookie_name: String,
    /// Cookie domain (host-only when unset)
    pub cookie_domain: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            public_key: String::new(),
            algorithm: SigningAlgorithm::Rs256,
            max_age: Duration::from_secs(3600),
            cookie_name: "jwtSgid".to_string(),
            cookie_domain: None,
        }
    }
}

/// Login state configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// HMAC key for the interaction creation-time hash
    pub secret: String,
}

/// Model lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Lifetime of `Client` models when the runtime supplies none
    #[serde(with = "humantime_serde")]
    pub client_model: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            client_model: Duration::from_secs(300),
        }
    }
}

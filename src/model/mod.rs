//! Persisted OIDC runtime models.
//!
//! The OIDC runtime hands us opaque payload objects for a handful of model
//! kinds and expects them back verbatim. [`ModelRecord`] is the stored shape:
//! the payload plus the fields we denormalize out of it for secondary-index
//! lookups and TTL.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::Result;
use crate::store::{AttrValue, IndexSpec, Item, StoreError, TableSpec, table_name};

mod adapter;

pub use adapter::{ModelAdapter, REVOCATION_CONCURRENCY, RevocationReport};

/// Runtime-defined payload object.
pub type Payload = serde_json::Map<String, Value>;

/// Attribute names of the `oidc-provider` table.
pub mod attr {
    /// Hash key: `<name>-<id>`
    pub const MODEL_ID: &str = "modelId";
    /// JSON-encoded payload
    pub const PAYLOAD: &str = "payload";
    /// Session uid
    pub const UID: &str = "uid";
    /// Grant id
    pub const GRANT_ID: &str = "grantId";
    /// Device-flow user code
    pub const USER_CODE: &str = "userCode";
    /// Epoch-seconds TTL
    pub const EXPIRES_AT: &str = "expiresAt";
    /// RFC 3339 creation time
    pub const CREATED_AT: &str = "createdAt";
    /// RFC 3339 last write time
    pub const UPDATED_AT: &str = "updatedAt";
}

/// Index on `uid`
pub const UID_INDEX: &str = "uidIndex";
/// Index on `grantId`
pub const GRANT_ID_INDEX: &str = "grantIdIndex";
/// Index on `userCode`
pub const USER_CODE_INDEX: &str = "userCodeIndex";

/// Layout of the model table.
#[must_use]
pub fn model_table(prefix: &str) -> TableSpec {
    TableSpec {
        name: table_name(prefix, "oidc-provider"),
        hash_key: attr::MODEL_ID,
        ttl_attribute: Some(attr::EXPIRES_AT),
        indexes: vec![
            IndexSpec {
                name: UID_INDEX,
                attribute: attr::UID,
            },
            IndexSpec {
                name: GRANT_ID_INDEX,
                attribute: attr::GRANT_ID,
            },
            IndexSpec {
                name: USER_CODE_INDEX,
                attribute: attr::USER_CODE,
            },
        ],
    }
}

/// Model kinds this deployment persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    /// Authorization code
    AuthorizationCode,
    /// Registered client
    Client,
    /// Consent grant
    Grant,
    /// Login/consent interaction
    Interaction,
    /// End-user session
    Session,
}

impl ModelKind {
    /// Classify a payload `kind` value, ignoring ASCII case.
    ///
    /// Returns `None` for kinds that are not persisted.
    #[must_use]
    pub fn parse(kind: &str) -> Option<Self> {
        [
            Self::AuthorizationCode,
            Self::Client,
            Self::Grant,
            Self::Interaction,
            Self::Session,
        ]
        .into_iter()
        .find(|k| k.as_str().eq_ignore_ascii_case(kind))
    }

    /// Canonical name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationCode => "AuthorizationCode",
            Self::Client => "Client",
            Self::Grant => "Grant",
            Self::Interaction => "Interaction",
            Self::Session => "Session",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRecord {
    /// `<name>-<id>`
    pub model_id: String,
    /// Runtime payload, round-tripped verbatim
    pub payload: Payload,
    /// Copy of `payload.uid`
    pub uid: Option<String>,
    /// Copy of `payload.grantId`
    pub grant_id: Option<String>,
    /// Copy of `payload.userCode`
    pub user_code: Option<String>,
    /// Logical expiry (epoch seconds)
    pub expires_at: Option<i64>,
    /// Creation time
    pub created_at: Option<String>,
    /// Last write time
    pub updated_at: Option<String>,
}

impl ModelRecord {
    /// Build a record, denormalizing the indexed fields out of `payload`.
    #[must_use]
    pub fn new(model_id: String, payload: Payload) -> Self {
        let field = |name: &str| payload.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            uid: field("uid"),
            grant_id: field("grantId"),
            user_code: field("userCode"),
            model_id,
            payload,
            expires_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Encode into a store item. Absent optional fields are omitted.
    pub fn to_item(&self) -> Result<Item> {
        let mut item = HashMap::from([
            (attr::MODEL_ID.to_string(), AttrValue::from(self.model_id.as_str())),
            (
                attr::PAYLOAD.to_string(),
                AttrValue::S(serde_json::to_string(&self.payload)?),
            ),
        ]);
        let optional = [
            (attr::UID, self.uid.clone().map(AttrValue::S)),
            (attr::GRANT_ID, self.grant_id.clone().map(AttrValue::S)),
            (attr::USER_CODE, self.user_code.clone().map(AttrValue::S)),
            (attr::EXPIRES_AT, self.expires_at.map(AttrValue::N)),
            (attr::CREATED_AT, self.created_at.clone().map(AttrValue::S)),
            (attr::UPDATED_AT, self.updated_at.clone().map(AttrValue::S)),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                item.insert(name.to_string(), value);
            }
        }
        Ok(item)
    }

    /// Decode a store item.
    pub fn from_item(item: &Item) -> Result<Self> {
        let string = |name: &str| item.get(name).and_then(AttrValue::as_str).map(str::to_string);

        let model_id = string(attr::MODEL_ID)
            .ok_or_else(|| StoreError::Malformed(format!("missing {}", attr::MODEL_ID)))?;
        let raw = item
            .get(attr::PAYLOAD)
            .and_then(AttrValue::as_str)
            .ok_or_else(|| StoreError::Malformed(format!("{model_id} has no payload")))?;
        let payload = serde_json::from_str(raw)
            .map_err(|e| StoreError::Malformed(format!("{model_id} payload: {e}")))?;

        Ok(Self {
            payload,
            uid: string(attr::UID),
            grant_id: string(attr::GRANT_ID),
            user_code: string(attr::USER_CODE),
            expires_at: item.get(attr::EXPIRES_AT).and_then(AttrValue::as_i64),
            created_at: string(attr::CREATED_AT),
            updated_at: string(attr::UPDATED_AT),
            model_id,
        })
    }

    /// Whether the record is logically expired at `now` (epoch seconds).
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }
}

/// Storage port the OIDC runtime calls into, one instance per model name.
#[async_trait::async_trait]
pub trait OidcAdapter: Send + Sync {
    /// Create or update the model stored under `id`.
    ///
    /// `expires_in` is the runtime-supplied lifetime in seconds.
    async fn upsert(&self, id: &str, payload: Payload, expires_in: Option<u64>) -> Result<()>;

    /// Fetch a live model by id.
    async fn find(&self, id: &str) -> Result<Option<Payload>>;

    /// Fetch a live model by device-flow user code.
    async fn find_by_user_code(&self, user_code: &str) -> Result<Option<Payload>>;

    /// Fetch a live model by session uid.
    async fn find_by_uid(&self, uid: &str) -> Result<Option<Payload>>;

    /// Mark a model as consumed. Fails with `NotFound` if it does not exist.
    async fn consume(&self, id: &str) -> Result<()>;

    /// Delete a model. Deleting an absent model succeeds.
    async fn destroy(&self, id: &str) -> Result<()>;

    /// Delete every live model belonging to `grant_id`.
    async fn revoke_by_grant_id(&self, grant_id: &str) -> Result<RevocationReport>;
}

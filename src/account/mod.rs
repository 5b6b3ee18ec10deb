//! Account directory.
//!
//! Accounts are keyed by verified email. An account starts *pending*, holding
//! the single-use onboarding token in `state`, and becomes *bound* once a
//! federated login attaches the provider's subject identifier (`sub`). Binding
//! clears `state`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::store::{
    AttrValue, Changes, Condition, IndexQuery, IndexSpec, Item, KeyValueStore, StoreError,
    TableSpec, table_name,
};
use crate::{Error, Result};

/// Attribute names of the `user` table.
pub mod attr {
    /// Hash key
    pub const EMAIL: &str = "email";
    /// Provider subject identifier
    pub const SUB: &str = "sub";
    /// Current internal session id
    pub const SSO_SESSION_ID: &str = "ssoSessionId";
    /// Pending onboarding token
    pub const STATE: &str = "state";
    /// Profile attributes from the provider
    pub const ATTRIBUTES: &str = "attributes";
}

/// Index on `sub`
pub const SUB_INDEX: &str = "subIndex";
/// Index on `state`
pub const STATE_INDEX: &str = "stateIndex";

/// Profile attribute holding the display name.
pub const NAME_ATTRIBUTE: &str = "myinfo.name";

/// Layout of the account table.
#[must_use]
pub fn account_table(prefix: &str) -> TableSpec {
    TableSpec {
        name: table_name(prefix, "user"),
        hash_key: attr::EMAIL,
        ttl_attribute: None,
        indexes: vec![
            IndexSpec {
                name: SUB_INDEX,
                attribute: attr::SUB,
            },
            IndexSpec {
                name: STATE_INDEX,
                attribute: attr::STATE,
            },
        ],
    }
}

/// An internal account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Account {
    /// Primary key
    pub email: String,
    /// Bound provider subject
    pub sub: Option<String>,
    /// Current internal session id
    pub sso_session_id: Option<String>,
    /// Pending onboarding token
    pub state: Option<String>,
    /// Provider profile attributes
    pub attributes: BTreeMap<String, String>,
}

impl Account {
    /// Whether a provider subject is attached.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.sub.is_some()
    }

    /// Display name from the provider profile, if known.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.attributes.get(NAME_ATTRIBUTE).map(String::as_str)
    }

    fn to_item(&self) -> Item {
        let mut item = HashMap::from([
            (attr::EMAIL.to_string(), AttrValue::from(self.email.as_str())),
            (attr::ATTRIBUTES.to_string(), AttrValue::M(self.attributes.clone())),
        ]);
        for (name, value) in [
            (attr::SUB, &self.sub),
            (attr::SSO_SESSION_ID, &self.sso_session_id),
            (attr::STATE, &self.state),
        ] {
            if let Some(value) = value {
                item.insert(name.to_string(), AttrValue::from(value.as_str()));
            }
        }
        item
    }

    fn from_item(item: &Item) -> Result<Self> {
        let string = |name: &str| item.get(name).and_then(AttrValue::as_str).map(str::to_string);
        Ok(Self {
            email: string(attr::EMAIL)
                .ok_or_else(|| StoreError::Malformed(format!("account without {}", attr::EMAIL)))?,
            sub: string(attr::SUB),
            sso_session_id: string(attr::SSO_SESSION_ID),
            state: string(attr::STATE),
            attributes: item
                .get(attr::ATTRIBUTES)
                .and_then(AttrValue::as_map)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// Principal handed to the OIDC runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OidcAccount {
    /// Account id (email)
    pub account_id: String,
    /// Provider subject
    pub subject: Option<String>,
    /// Display name
    pub display_name: Option<String>,
    /// Current internal session id
    pub sso_session_id: Option<String>,
}

impl OidcAccount {
    /// Claims released to relying parties.
    #[must_use]
    pub fn claims(&self) -> Value {
        json!({
            "sub": self.subject,
            "email": self.account_id,
            "name": self.display_name,
        })
    }
}

impl From<Account> for OidcAccount {
    fn from(account: Account) -> Self {
        Self {
            display_name: account.display_name().map(str::to_string),
            account_id: account.email,
            subject: account.sub,
            sso_session_id: account.sso_session_id,
        }
    }
}

/// Account-lookup hook exposed to the OIDC runtime.
#[async_trait::async_trait]
pub trait AccountLookup: Send + Sync {
    /// Resolve the principal for `account_id`; `NotFound` fails authentication.
    async fn find_account(&self, account_id: &str) -> Result<OidcAccount>;
}

/// Reads and writes accounts.
pub struct AccountDirectory {
    store: Arc<dyn KeyValueStore>,
    table: TableSpec,
}

impl AccountDirectory {
    /// Create a directory over `table`.
    pub fn new(store: Arc<dyn KeyValueStore>, table: TableSpec) -> Self {
        Self { store, table }
    }

    /// Create a pending account holding onboarding token `state`.
    ///
    /// Fails with `Conflict` if an account already exists for `email`.
    pub async fn create(&self, email: &str, state: &str) -> Result<Account> {
        let account = Account {
            email: email.to_string(),
            state: Some(state.to_string()),
            ..Account::default()
        };
        self.store
            .put(&self.table, account.to_item(), Some(Condition::NotExists))
            .await
            .map_err(|e| match e {
                StoreError::ConditionFailed(_) => {
                    Error::Conflict(format!("account {email} already exists"))
                }
                other => other.into(),
            })?;
        info!(email = %email, action = "create_account", "Created pending account");
        Ok(account)
    }

    /// Replace the onboarding token of an existing account.
    pub async fn reissue_state(&self, email: &str, state: &str) -> Result<Account> {
        let changes = Changes::new().set(attr::STATE, state);
        let item = self
            .store
            .update(&self.table, email, changes, Some(Condition::Exists))
            .await
            .map_err(|e| not_found_on_condition(e, email))?;
        debug!(email = %email, "Re-issued onboarding token");
        Account::from_item(&item)
    }

    /// Attach provider subject `sub` and profile `attributes` to an account.
    ///
    /// Attributes are merged into the stored ones and the onboarding token is
    /// cleared. Fails with `Conflict` if another account already holds `sub`.
    pub async fn bind(
        &self,
        email: &str,
        sub: &str,
        attributes: BTreeMap<String, String>,
    ) -> Result<Account> {
        let holder = self.resolve_by_subject(sub).await?;
        if let Some(holder) = holder.filter(|h| h.email != email) {
            return Err(Error::Conflict(format!(
                "subject is already bound to another account ({})",
                holder.email
            )));
        }

        let Some(item) = self.store.get(&self.table, email).await? else {
            return Err(Error::NotFound("User".to_string()));
        };
        let current = Account::from_item(&item)?;
        let mut merged = current.attributes;
        merged.extend(attributes);

        // The merge is only valid against the attributes we read.
        let condition = match item.get(attr::ATTRIBUTES) {
            Some(read) => Condition::Equals {
                attribute: attr::ATTRIBUTES.to_string(),
                value: read.clone(),
            },
            None => Condition::Exists,
        };
        let changes = Changes::new()
            .set(attr::SUB, sub)
            .set(attr::ATTRIBUTES, merged)
            .remove(attr::STATE);
        let item = self
            .store
            .update(&self.table, email, changes, Some(condition))
            .await
            .map_err(|e| match e {
                StoreError::ConditionFailed(_) => {
                    Error::Conflict(format!("account {email} changed while binding"))
                }
                other => other.into(),
            })?;

        info!(email = %email, action = "bind_account", "Bound account to federated subject");
        Account::from_item(&item)
    }

    /// Store the current internal session id for `email`.
    pub async fn record_session(&self, email: &str, sso_session_id: &str) -> Result<()> {
        let changes = Changes::new().set(attr::SSO_SESSION_ID, sso_session_id);
        self.store
            .update(&self.table, email, changes, Some(Condition::Exists))
            .await
            .map_err(|e| not_found_on_condition(e, email))?;
        Ok(())
    }

    /// Fetch by primary key; `NotFound` if absent.
    pub async fn resolve_by_email(&self, email: &str) -> Result<Account> {
        match self.store.get(&self.table, email).await? {
            Some(item) => Account::from_item(&item),
            None => {
                debug!(email = %email, "Account lookup by email missed");
                Err(Error::NotFound("User".to_string()))
            }
        }
    }

    /// Account bound to provider subject `sub`, if any.
    pub async fn resolve_by_subject(&self, sub: &str) -> Result<Option<Account>> {
        self.resolve_by_index(SUB_INDEX, sub).await
    }

    /// Pending account holding onboarding token `state`, if any.
    pub async fn resolve_by_state(&self, state: &str) -> Result<Option<Account>> {
        Ok(self
            .resolve_by_index(STATE_INDEX, state)
            .await?
            .filter(|account| !account.is_bound()))
    }

    async fn resolve_by_index(&self, index: &str, value: &str) -> Result<Option<Account>> {
        let query = IndexQuery::new(index, value).limit(1);
        let items = self.store.query(&self.table, &query).await?;
        items.first().map(Account::from_item).transpose()
    }
}

fn not_found_on_condition(err: StoreError, email: &str) -> Error {
    match err {
        StoreError::ConditionFailed(_) => Error::NotFound(format!("User {email}")),
        other => other.into(),
    }
}

#[async_trait::async_trait]
impl AccountLookup for AccountDirectory {
    async fn find_account(&self, account_id: &str) -> Result<OidcAccount> {
        self.resolve_by_email(account_id).await.map(OidcAccount::from)
    }
}

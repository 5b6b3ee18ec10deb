//! Key-value storage port.
//!
//! The broker persists everything in a schema-less key-value store that
//! offers primary-key lookups, secondary-index queries and *lazy* TTL expiry:
//! the backend may keep an expired row around for a long time after its TTL
//! attribute has elapsed. Every read path here therefore filters on the TTL
//! attribute itself instead of trusting the backend to have reclaimed the row.
//!
//! Two backends implement [`KeyValueStore`]:
//!
//! - [`MemoryStore`]: in-process tables with a background reaper that only
//!   reclaims expired rows after a configurable delay.
//! - `DynamoStore` (feature `dynamodb`): Amazon `DynamoDB`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

mod memory;
#[cfg(feature = "dynamodb")]
mod dynamodb;

#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoStore;
pub use memory::{MemoryStore, spawn_reaper};

/// Maximum number of keys accepted by a single batch delete.
pub const BATCH_WRITE_LIMIT: usize = 25;

/// A stored row: attribute name → value.
pub type Item = HashMap<String, AttrValue>;

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage-level errors. Callers translate these into [`crate::Error`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A conditional write was rejected.
    #[error("condition not met: {0}")]
    ConditionFailed(String),

    /// Batch exceeded the backend's batch-write limit.
    #[error("batch of {size} exceeds the limit of {limit}")]
    BatchTooLarge {
        /// Keys in the rejected batch
        size: usize,
        /// Backend limit
        limit: usize,
    },

    /// A stored row could not be decoded.
    #[error("malformed item: {0}")]
    Malformed(String),

    /// Transport or service failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    /// String
    S(String),
    /// Integer number
    N(i64),
    /// Flat string map
    M(BTreeMap<String, String>),
}

impl AttrValue {
    /// Borrow the string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::S(s) => Some(s),
            _ => None,
        }
    }

    /// The numeric value, if this is a number.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::N(n) => Some(*n),
            _ => None,
        }
    }

    /// Borrow the map value, if this is a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::M(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::S(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::S(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        Self::N(n)
    }
}

impl From<BTreeMap<String, String>> for AttrValue {
    fn from(m: BTreeMap<String, String>) -> Self {
        Self::M(m)
    }
}

/// A secondary index over one string attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name
    pub name: &'static str,
    /// Indexed attribute
    pub attribute: &'static str,
}

/// Physical layout of one table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    /// Full table name (including any deployment prefix)
    pub name: String,
    /// Hash key attribute
    pub hash_key: &'static str,
    /// Epoch-seconds attribute after which a row is logically gone
    pub ttl_attribute: Option<&'static str>,
    /// Secondary indexes
    pub indexes: Vec<IndexSpec>,
}

impl TableSpec {
    /// Look up an index by name.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Extract the hash key value from an item.
    #[must_use]
    pub fn key_of<'a>(&self, item: &'a Item) -> Option<&'a str> {
        item.get(self.hash_key).and_then(AttrValue::as_str)
    }

    /// Whether `item` is still logically present at `now` (epoch seconds).
    ///
    /// Rows without a TTL attribute never expire.
    #[must_use]
    pub fn is_live(&self, item: &Item, now: i64) -> bool {
        self.ttl_attribute
            .and_then(|attr| item.get(attr))
            .and_then(AttrValue::as_i64)
            .is_none_or(|expires_at| now <= expires_at)
    }
}

/// Precondition on the current version of the item being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// The item must already exist.
    Exists,
    /// The item must not exist.
    NotExists,
    /// The item must exist and `attribute` must equal `value`.
    Equals {
        /// Attribute to compare
        attribute: String,
        /// Expected value
        value: AttrValue,
    },
}

impl Condition {
    /// Evaluate against the current stored version (`None` = absent).
    #[must_use]
    pub fn holds(&self, current: Option<&Item>) -> bool {
        match (self, current) {
            (Self::Exists, current) => current.is_some(),
            (Self::NotExists, current) => current.is_none(),
            (Self::Equals { attribute, value }, Some(item)) => item.get(attribute) == Some(value),
            (Self::Equals { .. }, None) => false,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exists => f.write_str("item exists"),
            Self::NotExists => f.write_str("item does not exist"),
            Self::Equals { attribute, .. } => write!(f, "{attribute} unchanged"),
        }
    }
}

/// A merge update: attributes to set and attributes to remove.
///
/// Attributes not mentioned are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// Attributes to set
    pub set: Item,
    /// Attributes to remove
    pub remove: Vec<String>,
}

impl Changes {
    /// Empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `attribute` to `value`.
    #[must_use]
    pub fn set(mut self, attribute: &str, value: impl Into<AttrValue>) -> Self {
        self.set.insert(attribute.to_string(), value.into());
        self
    }

    /// Set `attribute` only when a value is present.
    #[must_use]
    pub fn set_opt(self, attribute: &str, value: Option<impl Into<AttrValue>>) -> Self {
        match value {
            Some(v) => self.set(attribute, v),
            None => self,
        }
    }

    /// Remove `attribute`.
    #[must_use]
    pub fn remove(mut self, attribute: &str) -> Self {
        self.remove.push(attribute.to_string());
        self
    }

    /// Apply to an item in place.
    pub fn apply_to(&self, item: &mut Item) {
        for attr in &self.remove {
            item.remove(attr);
        }
        for (attr, value) in &self.set {
            item.insert(attr.clone(), value.clone());
        }
    }
}

/// Point query against a secondary index.
#[derive(Debug, Clone)]
pub struct IndexQuery<'a> {
    /// Index name
    pub index: &'a str,
    /// Value of the indexed attribute
    pub value: &'a str,
    /// Maximum number of items returned, applied after TTL filtering
    pub limit: Option<usize>,
    /// Drop rows whose TTL attribute has elapsed
    pub live_only: bool,
}

impl<'a> IndexQuery<'a> {
    /// Query `index` for rows whose indexed attribute equals `value`.
    #[must_use]
    pub fn new(index: &'a str, value: &'a str) -> Self {
        Self {
            index,
            value,
            limit: None,
            live_only: false,
        }
    }

    /// Return at most `limit` rows.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip expired rows.
    #[must_use]
    pub fn live_only(mut self) -> Self {
        self.live_only = true;
        self
    }
}

/// Trait abstracting the key-value backend.
///
/// Implementations must be `Send + Sync` because one store is shared by all
/// request handlers.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Fetch a row by hash key, regardless of TTL.
    async fn get(&self, table: &TableSpec, key: &str) -> StoreResult<Option<Item>>;

    /// Write a full row, replacing any existing version.
    async fn put(&self, table: &TableSpec, item: Item, condition: Option<Condition>)
    -> StoreResult<()>;

    /// Merge `changes` into the row (creating it when absent and unconditioned)
    /// and return the new version.
    async fn update(
        &self,
        table: &TableSpec,
        key: &str,
        changes: Changes,
        condition: Option<Condition>,
    ) -> StoreResult<Item>;

    /// Delete a row. Deleting an absent row is not an error.
    async fn delete(&self, table: &TableSpec, key: &str) -> StoreResult<()>;

    /// Delete up to [`BATCH_WRITE_LIMIT`] rows in one call.
    async fn batch_delete(&self, table: &TableSpec, keys: &[String]) -> StoreResult<()>;

    /// Query a secondary index.
    async fn query(&self, table: &TableSpec, query: &IndexQuery<'_>) -> StoreResult<Vec<Item>>;

    /// Fetch a row by hash key, treating an elapsed TTL as absent.
    async fn get_live(&self, table: &TableSpec, key: &str) -> StoreResult<Option<Item>> {
        let item = self.get(table, key).await?;
        Ok(item.filter(|item| table.is_live(item, epoch_seconds())))
    }
}

/// Current time in epoch seconds.
#[must_use]
pub fn epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Build the physical table name for a logical table.
#[must_use]
pub fn table_name(prefix: &str, table: &str) -> String {
    format!("{prefix}ogpass-{table}")
}

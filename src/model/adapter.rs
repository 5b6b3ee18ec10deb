//! [`OidcAdapter`] over a [`KeyValueStore`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{
    GRANT_ID_INDEX, ModelKind, ModelRecord, OidcAdapter, Payload, UID_INDEX, USER_CODE_INDEX,
    attr,
};
use crate::store::{
    BATCH_WRITE_LIMIT, Changes, Condition, IndexQuery, KeyValueStore, StoreError, TableSpec,
    epoch_seconds,
};
use crate::{Error, Result};

/// Batch deletes in flight at once during grant revocation.
pub const REVOCATION_CONCURRENCY: usize = 2;

/// Outcome of [`OidcAdapter::revoke_by_grant_id`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevocationReport {
    /// Live models found for the grant
    pub matched: usize,
    /// Batches issued
    pub batches: usize,
    /// Batches that failed to delete
    pub failed_batches: usize,
}

/// Persists one runtime model name (`Session`, `Grant`, ...).
pub struct ModelAdapter {
    name: String,
    store: Arc<dyn KeyValueStore>,
    table: TableSpec,
    client_ttl: Duration,
}

impl ModelAdapter {
    /// Create the adapter the runtime uses for model `name`.
    ///
    /// `client_ttl` is the lifetime stamped on `Client` models when the
    /// runtime does not supply one.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        table: TableSpec,
        client_ttl: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            table,
            client_ttl,
        }
    }

    fn model_id(&self, id: &str) -> String {
        format!("{}-{id}", self.name)
    }

    fn expires_at(&self, kind: ModelKind, expires_in: Option<u64>, now: i64) -> Option<i64> {
        match (expires_in, kind) {
            (Some(secs), _) => Some(now.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX))),
            (None, ModelKind::Client) => Some(
                now.saturating_add(i64::try_from(self.client_ttl.as_secs()).unwrap_or(i64::MAX)),
            ),
            (None, _) => None,
        }
    }

    async fn find_by_index(&self, index: &str, value: &str) -> Result<Option<Payload>> {
        let query = IndexQuery::new(index, value).live_only().limit(1);
        let items = self.store.query(&self.table, &query).await?;
        let now = epoch_seconds();

        match items.first() {
            Some(item) => {
                let record = ModelRecord::from_item(item)?;
                Ok((!record.is_expired(now)).then_some(record.payload))
            }
            None => Ok(None),
        }
    }
}

/// Condition that holds only while the stored row is still the version
/// `record` was read from.
fn version_condition(record: &ModelRecord) -> Condition {
    match (&record.updated_at, record.expires_at) {
        (Some(updated_at), _) => Condition::Equals {
            attribute: attr::UPDATED_AT.to_string(),
            value: updated_at.as_str().into(),
        },
        (None, Some(expires_at)) => Condition::Equals {
            attribute: attr::EXPIRES_AT.to_string(),
            value: expires_at.into(),
        },
        (None, None) => Condition::Exists,
    }
}

fn write_error(err: StoreError, model_id: &str) -> Error {
    match err {
        StoreError::ConditionFailed(detail) => Error::Conflict(format!("{model_id}: {detail}")),
        other => other.into(),
    }
}

#[async_trait::async_trait]
impl OidcAdapter for ModelAdapter {
    async fn upsert(&self, id: &str, payload: Payload, expires_in: Option<u64>) -> Result<()> {
        let model_id = self.model_id(id);
        let kind = payload.get("kind").and_then(Value::as_str);
        let Some(kind) = kind.and_then(ModelKind::parse) else {
            debug!(model_id = %model_id, kind = ?kind, "Letting unpersisted model kind pass through");
            return Ok(());
        };

        let now = epoch_seconds();
        let timestamp = chrono::Utc::now().to_rfc3339();
        let mut record = ModelRecord::new(model_id.clone(), payload);
        record.expires_at = self.expires_at(kind, expires_in, now);

        let existing = match self.store.get(&self.table, &model_id).await? {
            Some(item) => Some(ModelRecord::from_item(&item)?),
            None => None,
        };
        match existing {
            None => {
                record.created_at = Some(timestamp.clone());
                record.updated_at = Some(timestamp);
                self.store
                    .put(&self.table, record.to_item()?, Some(Condition::NotExists))
                    .await
                    .map_err(|e| {
                        error!(model_id = %model_id, kind = %kind, error = %e, "Failed to create model");
                        write_error(e, &model_id)
                    })?;
                debug!(model_id = %model_id, kind = %kind, "Created model");
            }
            Some(stale) if stale.is_expired(now) => {
                // Replace the expired row whole unless it was rewritten since
                // the read.
                let condition = version_condition(&stale);
                record.created_at = Some(timestamp.clone());
                record.updated_at = Some(timestamp);
                self.store
                    .put(&self.table, record.to_item()?, Some(condition))
                    .await
                    .map_err(|e| {
                        error!(model_id = %model_id, kind = %kind, error = %e, "Failed to replace expired model");
                        write_error(e, &model_id)
                    })?;
                debug!(model_id = %model_id, kind = %kind, "Replaced expired model");
            }
            Some(_) => {
                // Merge: indexed fields absent from the new payload keep their
                // stored values.
                let changes = Changes::new()
                    .set(attr::PAYLOAD, serde_json::to_string(&record.payload)?)
                    .set_opt(attr::UID, record.uid)
                    .set_opt(attr::GRANT_ID, record.grant_id)
                    .set_opt(attr::USER_CODE, record.user_code)
                    .set_opt(attr::EXPIRES_AT, record.expires_at)
                    .set(attr::UPDATED_AT, timestamp);
                self.store
                    .update(&self.table, &model_id, changes, Some(Condition::Exists))
                    .await
                    .map_err(|e| {
                        error!(model_id = %model_id, kind = %kind, error = %e, "Failed to update model");
                        write_error(e, &model_id)
                    })?;
                debug!(model_id = %model_id, kind = %kind, "Updated model");
            }
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<Payload>> {
        let model_id = self.model_id(id);
        let Some(item) = self.store.get(&self.table, &model_id).await? else {
            return Ok(None);
        };
        let record = ModelRecord::from_item(&item)?;
        if record.is_expired(epoch_seconds()) {
            debug!(model_id = %model_id, "Ignoring expired model");
            return Ok(None);
        }
        Ok(Some(record.payload))
    }

    async fn find_by_user_code(&self, user_code: &str) -> Result<Option<Payload>> {
        self.find_by_index(USER_CODE_INDEX, user_code).await
    }

    async fn find_by_uid(&self, uid: &str) -> Result<Option<Payload>> {
        self.find_by_index(UID_INDEX, uid).await
    }

    async fn consume(&self, id: &str) -> Result<()> {
        let model_id = self.model_id(id);
        let Some(item) = self.store.get_live(&self.table, &model_id).await? else {
            return Err(Error::NotFound(format!("Model {model_id}")));
        };
        let mut record = ModelRecord::from_item(&item)?;
        record
            .payload
            .insert("consumed".to_string(), Value::from(epoch_seconds()));

        // Only the payload changes; the condition rejects a concurrent writer
        // that replaced the payload since we read it.
        let condition = version_condition(&record);
        let changes = Changes::new()
            .set(attr::PAYLOAD, serde_json::to_string(&record.payload)?)
            .set(attr::UPDATED_AT, chrono::Utc::now().to_rfc3339());

        self.store
            .update(&self.table, &model_id, changes, Some(condition))
            .await
            .map_err(|e| write_error(e, &model_id))?;
        debug!(model_id = %model_id, "Consumed model");
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        let model_id = self.model_id(id);
        self.store.delete(&self.table, &model_id).await?;
        debug!(model_id = %model_id, "Destroyed model");
        Ok(())
    }

    async fn revoke_by_grant_id(&self, grant_id: &str) -> Result<RevocationReport> {
        let query = IndexQuery::new(GRANT_ID_INDEX, grant_id).live_only();
        let items = self.store.query(&self.table, &query).await?;
        let keys: Vec<String> = items
            .iter()
            .filter_map(|item| self.table.key_of(item).map(str::to_string))
            .collect();

        let batches: Vec<Vec<String>> = keys
            .chunks(BATCH_WRITE_LIMIT)
            .map(<[String]>::to_vec)
            .collect();
        let mut report = RevocationReport {
            matched: keys.len(),
            batches: batches.len(),
            failed_batches: 0,
        };

        let results: Vec<(Vec<String>, std::result::Result<(), StoreError>)> =
            futures::stream::iter(batches)
                .map(|batch| {
                    let store = Arc::clone(&self.store);
                    let table = self.table.clone();
                    async move {
                        let result = store.batch_delete(&table, &batch).await;
                        (batch, result)
                    }
                })
                .buffer_unordered(REVOCATION_CONCURRENCY)
                .collect()
                .await;

        for (batch, result) in results {
            if let Err(e) = result {
                report.failed_batches += 1;
                error!(
                    grant_id = %grant_id,
                    models = ?batch,
                    error = %e,
                    "Failed to delete some models"
                );
            }
        }

        if report.failed_batches > 0 {
            let partial = Error::PartialRevocation {
                grant_id: grant_id.to_string(),
                failed: report.failed_batches,
                batches: report.batches,
            };
            warn!(grant_id = %grant_id, "{partial}");
        } else {
            debug!(
                grant_id = %grant_id,
                matched = report.matched,
                batches = report.batches,
                "Revoked models for grant"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::model_table;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test payloads are objects"),
        }
    }

    fn adapter(name: &str, store: &Arc<MemoryStore>) -> ModelAdapter {
        ModelAdapter::new(
            name,
            Arc::clone(store) as Arc<dyn KeyValueStore>,
            model_table(""),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn unknown_kind_is_not_stored() {
        // GIVEN: an adapter for a model kind this deployment does not persist
        let store = Arc::new(MemoryStore::default());
        let tokens = adapter("AccessToken", &store);

        // WHEN: the runtime upserts it
        tokens
            .upsert("t1", payload(json!({"kind": "AccessToken"})), Some(60))
            .await
            .unwrap();

        // THEN: nothing is written and find returns absent
        assert_eq!(store.physical_len("ogpass-oidc-provider"), 0);
        assert!(tokens.find("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn client_models_get_default_ttl() {
        let store = Arc::new(MemoryStore::default());
        let clients = adapter("Client", &store);
        clients
            .upsert("c1", payload(json!({"kind": "Client", "client_id": "c1"})), None)
            .await
            .unwrap();

        let item = store
            .get(&model_table(""), "Client-c1")
            .await
            .unwrap()
            .unwrap();
        let record = ModelRecord::from_item(&item).unwrap();
        let expires_at = record.expires_at.unwrap();
        let now = epoch_seconds();
        assert!((now + 295..=now + 300).contains(&expires_at));
    }

    #[tokio::test]
    async fn sessions_without_lifetime_never_expire() {
        let store = Arc::new(MemoryStore::default());
        let sessions = adapter("Session", &store);
        sessions
            .upsert("s1", payload(json!({"kind": "Session"})), None)
            .await
            .unwrap();

        let item = store
            .get(&model_table(""), "Session-s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ModelRecord::from_item(&item).unwrap().expires_at, None);
    }

    #[tokio::test]
    async fn update_preserves_created_at() {
        // GIVEN: a stored grant
        let store = Arc::new(MemoryStore::default());
        let grants = adapter("Grant", &store);
        grants
            .upsert("g1", payload(json!({"kind": "Grant", "grantId": "g1"})), Some(60))
            .await
            .unwrap();
        let table = model_table("");
        let first = ModelRecord::from_item(&store.get(&table, "Grant-g1").await.unwrap().unwrap())
            .unwrap();

        // WHEN: it is upserted again
        grants
            .upsert("g1", payload(json!({"kind": "Grant", "scope": "openid"})), Some(60))
            .await
            .unwrap();

        // THEN: creation time is unchanged and the index field survives
        let second = ModelRecord::from_item(&store.get(&table, "Grant-g1").await.unwrap().unwrap())
            .unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.grant_id.as_deref(), Some("g1"));
        assert_eq!(second.payload.get("scope"), Some(&json!("openid")));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let sessions = adapter("Session", &store);
        sessions.destroy("never-existed").await.unwrap();
        sessions
            .upsert("s1", payload(json!({"kind": "Session"})), None)
            .await
            .unwrap();
        sessions.destroy("s1").await.unwrap();
        sessions.destroy("s1").await.unwrap();
        assert!(sessions.find("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consume_rejects_concurrent_rewrite() {
        // GIVEN: a stored code whose updatedAt we will change underneath consume
        let store = Arc::new(MemoryStore::default());
        let table = model_table("");
        let codes = adapter("AuthorizationCode", &store);
        codes
            .upsert("c1", payload(json!({"kind": "AuthorizationCode"})), Some(60))
            .await
            .unwrap();

        // WHEN: the guarded update is evaluated against a stale updatedAt
        let stale = Condition::Equals {
            attribute: attr::UPDATED_AT.to_string(),
            value: "1970-01-01T00:00:00+00:00".into(),
        };
        let err = store
            .update(&table, "AuthorizationCode-c1", Changes::new(), Some(stale))
            .await
            .unwrap_err();

        // THEN: it maps to a conflict
        assert!(matches!(write_error(err, "AuthorizationCode-c1"), Error::Conflict(_)));
    }
}

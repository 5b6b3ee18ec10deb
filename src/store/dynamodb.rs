//! Amazon `DynamoDB` backend.
//!
//! `DynamoDB` deletes TTL-expired items in the background, typically within
//! 48 hours, so queries always carry a TTL filter expression.

use std::collections::{BTreeMap, HashMap};

use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, ReturnValue, WriteRequest};
use tracing::{debug, info};

use super::{
    AttrValue, BATCH_WRITE_LIMIT, Changes, Condition, IndexQuery, Item, KeyValueStore,
    StoreError, StoreResult, TableSpec, epoch_seconds,
};
use crate::config::StoreConfig;

/// [`KeyValueStore`] backed by `DynamoDB`.
#[derive(Debug, Clone)]
pub struct DynamoStore {
    client: Client,
}

impl DynamoStore {
    /// Build a client from the ambient AWS credential chain.
    ///
    /// `region` and `endpoint` from the store configuration override the
    /// environment (the endpoint is how local `DynamoDB` is targeted).
    pub async fn connect(config: &StoreConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint,
            "DynamoDB store initialized"
        );

        Self {
            client: Client::new(&sdk_config),
        }
    }
}

/// Placeholder-based expression attributes shared by one request.
#[derive(Default)]
struct Expr {
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl Expr {
    fn name(&mut self, attribute: &str) -> String {
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    fn value(&mut self, value: &AttrValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), to_attribute(value));
        placeholder
    }

    fn condition(&mut self, table: &TableSpec, condition: &Condition) -> String {
        match condition {
            Condition::Exists => format!("attribute_exists({})", self.name(table.hash_key)),
            Condition::NotExists => {
                format!("attribute_not_exists({})", self.name(table.hash_key))
            }
            Condition::Equals { attribute, value } => {
                format!("{} = {}", self.name(attribute), self.value(value))
            }
        }
    }

    fn names(&self) -> Option<HashMap<String, String>> {
        (!self.names.is_empty()).then(|| self.names.clone())
    }

    fn values(&self) -> Option<HashMap<String, AttributeValue>> {
        (!self.values.is_empty()).then(|| self.values.clone())
    }
}

fn to_attribute(value: &AttrValue) -> AttributeValue {
    match value {
        AttrValue::S(s) => AttributeValue::S(s.clone()),
        AttrValue::N(n) => AttributeValue::N(n.to_string()),
        AttrValue::M(m) => AttributeValue::M(
            m.iter()
                .map(|(k, v)| (k.clone(), AttributeValue::S(v.clone())))
                .collect(),
        ),
    }
}

fn from_attribute(name: &str, value: &AttributeValue) -> StoreResult<AttrValue> {
    match value {
        AttributeValue::S(s) => Ok(AttrValue::S(s.clone())),
        AttributeValue::N(n) => n
            .parse()
            .map(AttrValue::N)
            .map_err(|_| StoreError::Malformed(format!("{name} is not an integer: {n}"))),
        AttributeValue::M(m) => m
            .iter()
            .map(|(k, v)| match v {
                AttributeValue::S(s) => Ok((k.clone(), s.clone())),
                _ => Err(StoreError::Malformed(format!("{name}.{k} is not a string"))),
            })
            .collect::<StoreResult<BTreeMap<_, _>>>()
            .map(AttrValue::M),
        _ => Err(StoreError::Malformed(format!("{name} has unsupported type"))),
    }
}

fn to_item(item: &Item) -> HashMap<String, AttributeValue> {
    item.iter()
        .map(|(k, v)| (k.clone(), to_attribute(v)))
        .collect()
}

fn from_item(raw: &HashMap<String, AttributeValue>) -> StoreResult<Item> {
    raw.iter()
        .map(|(k, v)| from_attribute(k, v).map(|v| (k.clone(), v)))
        .collect()
}

fn backend<E: std::error::Error>(op: &str, err: E) -> StoreError {
    StoreError::Backend(format!("{op}: {}", DisplayErrorContext(err)))
}

#[async_trait::async_trait]
impl KeyValueStore for DynamoStore {
    async fn get(&self, table: &TableSpec, key: &str) -> StoreResult<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(&table.name)
            .key(table.hash_key, AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(|e| backend("GetItem", e))?;

        output.item().map(from_item).transpose()
    }

    async fn put(
        &self,
        table: &TableSpec,
        item: Item,
        condition: Option<Condition>,
    ) -> StoreResult<()> {
        let mut expr = Expr::default();
        let condition_expression = condition.as_ref().map(|c| expr.condition(table, c));

        let result = self
            .client
            .put_item()
            .table_name(&table.name)
            .set_item(Some(to_item(&item)))
            .set_condition_expression(condition_expression)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    Err(StoreError::ConditionFailed(
                        condition.map(|c| c.to_string()).unwrap_or_default(),
                    ))
                } else {
                    Err(backend("PutItem", service))
                }
            }
        }
    }

    async fn update(
        &self,
        table: &TableSpec,
        key: &str,
        changes: Changes,
        condition: Option<Condition>,
    ) -> StoreResult<Item> {
        let mut expr = Expr::default();

        let mut set_clauses = Vec::with_capacity(changes.set.len());
        for (attr, value) in &changes.set {
            let name = expr.name(attr);
            let value = expr.value(value);
            set_clauses.push(format!("{name} = {value}"));
        }
        let remove_clauses: Vec<String> = changes.remove.iter().map(|a| expr.name(a)).collect();

        let mut update_expression = String::new();
        if !set_clauses.is_empty() {
            update_expression.push_str("SET ");
            update_expression.push_str(&set_clauses.join(", "));
        }
        if !remove_clauses.is_empty() {
            if !update_expression.is_empty() {
                update_expression.push(' ');
            }
            update_expression.push_str("REMOVE ");
            update_expression.push_str(&remove_clauses.join(", "));
        }
        if update_expression.is_empty() {
            return self
                .get(table, key)
                .await?
                .ok_or_else(|| StoreError::ConditionFailed(format!("{key} does not exist")));
        }

        let condition_expression = condition.as_ref().map(|c| expr.condition(table, c));

        let result = self
            .client
            .update_item()
            .table_name(&table.name)
            .key(table.hash_key, AttributeValue::S(key.to_string()))
            .update_expression(update_expression)
            .set_condition_expression(condition_expression)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => output
                .attributes()
                .map(from_item)
                .transpose()?
                .ok_or_else(|| StoreError::Malformed("UpdateItem returned no attributes".into())),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    Err(StoreError::ConditionFailed(
                        condition.map(|c| c.to_string()).unwrap_or_default(),
                    ))
                } else {
                    Err(backend("UpdateItem", service))
                }
            }
        }
    }

    async fn delete(&self, table: &TableSpec, key: &str) -> StoreResult<()> {
        self.client
            .delete_item()
            .table_name(&table.name)
            .key(table.hash_key, AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(|e| backend("DeleteItem", e))?;
        Ok(())
    }

    async fn batch_delete(&self, table: &TableSpec, keys: &[String]) -> StoreResult<()> {
        if keys.len() > BATCH_WRITE_LIMIT {
            return Err(StoreError::BatchTooLarge {
                size: keys.len(),
                limit: BATCH_WRITE_LIMIT,
            });
        }
        if keys.is_empty() {
            return Ok(());
        }

        let requests = keys
            .iter()
            .map(|key| {
                DeleteRequest::builder()
                    .key(table.hash_key, AttributeValue::S(key.clone()))
                    .build()
                    .map(|delete| WriteRequest::builder().delete_request(delete).build())
                    .map_err(|e| backend("DeleteRequest", e))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(&table.name, requests)
            .send()
            .await
            .map_err(|e| backend("BatchWriteItem", e))?;

        let unprocessed = output
            .unprocessed_items()
            .and_then(|items| items.get(&table.name))
            .map_or(0, Vec::len);
        if unprocessed > 0 {
            return Err(StoreError::Backend(format!(
                "BatchWriteItem left {unprocessed} of {} deletes unprocessed",
                keys.len()
            )));
        }
        Ok(())
    }

    async fn query(&self, table: &TableSpec, query: &IndexQuery<'_>) -> StoreResult<Vec<Item>> {
        let index = table.index(query.index).ok_or_else(|| {
            StoreError::Backend(format!("unknown index {} on {}", query.index, table.name))
        })?;

        let mut expr = Expr::default();
        let key_name = expr.name(index.attribute);
        let key_value = expr.value(&AttrValue::from(query.value));
        let key_condition = format!("{key_name} = {key_value}");

        let filter = match (query.live_only, table.ttl_attribute) {
            (true, Some(ttl)) => {
                let ttl_name = expr.name(ttl);
                let now = expr.value(&AttrValue::N(epoch_seconds()));
                Some(format!(
                    "attribute_not_exists({ttl_name}) OR {ttl_name} >= {now}"
                ))
            }
            _ => None,
        };

        let limit = query.limit.unwrap_or(usize::MAX);
        let mut items = Vec::new();
        let mut start_key = None;
        let mut pages = 0_usize;

        // Limit is applied after filtering, so keep paging until enough
        // live rows are collected or the index is exhausted.
        loop {
            let output = self
                .client
                .query()
                .table_name(&table.name)
                .index_name(index.name)
                .key_condition_expression(&key_condition)
                .set_filter_expression(filter.clone())
                .set_expression_attribute_names(expr.names())
                .set_expression_attribute_values(expr.values())
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| backend("Query", e))?;
            pages += 1;

            for raw in output.items() {
                if items.len() >= limit {
                    break;
                }
                items.push(from_item(raw)?);
            }

            match output.last_evaluated_key() {
                Some(next) if items.len() < limit => start_key = Some(next.clone()),
                _ => break,
            }
        }

        debug!(
            table = %table.name,
            index = index.name,
            pages,
            count = items.len(),
            "Index query complete"
        );
        Ok(items)
    }
}

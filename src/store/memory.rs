//! In-process key-value store.
//!
//! Rows live in per-table hash maps behind a single `RwLock`, so every
//! conditional write is evaluated and applied atomically. Expiry is lazy on
//! purpose: a row whose TTL attribute has elapsed stays physically present
//! until [`MemoryStore::reap_expired`] runs *and* `reclaim_delay` has also
//! passed, which is how managed stores with TTL behave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use super::{
    AttrValue, BATCH_WRITE_LIMIT, Changes, Condition, IndexQuery, Item, KeyValueStore,
    StoreError, StoreResult, TableSpec, epoch_seconds,
};

#[derive(Default)]
struct Table {
    ttl_attribute: Option<&'static str>,
    rows: HashMap<String, Item>,
}

/// In-memory [`KeyValueStore`].
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
    reclaim_delay: Duration,
}

impl MemoryStore {
    /// Create an empty store that physically reclaims expired rows only
    /// `reclaim_delay` after their TTL elapses.
    #[must_use]
    pub fn new(reclaim_delay: Duration) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            reclaim_delay,
        }
    }

    /// Number of rows physically held for `table`, expired ones included.
    #[must_use]
    pub fn physical_len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.rows.len())
    }

    /// Remove rows whose TTL elapsed more than `reclaim_delay` ago.
    ///
    /// Returns the number of rows removed.
    pub fn reap_expired(&self) -> usize {
        let delay = i64::try_from(self.reclaim_delay.as_secs()).unwrap_or(i64::MAX);
        let cutoff = epoch_seconds().saturating_sub(delay);
        let mut reaped = 0;

        for (name, table) in self.tables.write().iter_mut() {
            let Some(ttl) = table.ttl_attribute else {
                continue;
            };
            let before = table.rows.len();
            table.rows.retain(|_, row| {
                row.get(ttl)
                    .and_then(AttrValue::as_i64)
                    .is_none_or(|expires_at| expires_at >= cutoff)
            });
            let removed = before - table.rows.len();
            if removed > 0 {
                debug!(table = %name, count = removed, "Reclaimed expired rows");
            }
            reaped += removed;
        }
        reaped
    }

    fn with_table<R>(&self, spec: &TableSpec, f: impl FnOnce(&mut Table) -> R) -> R {
        let mut tables = self.tables.write();
        let table = tables.entry(spec.name.clone()).or_insert_with(|| Table {
            ttl_attribute: spec.ttl_attribute,
            rows: HashMap::new(),
        });
        f(table)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

fn check(condition: Option<&Condition>, current: Option<&Item>) -> StoreResult<()> {
    match condition {
        Some(cond) if !cond.holds(current) => Err(StoreError::ConditionFailed(cond.to_string())),
        _ => Ok(()),
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, table: &TableSpec, key: &str) -> StoreResult<Option<Item>> {
        Ok(self
            .tables
            .read()
            .get(&table.name)
            .and_then(|t| t.rows.get(key))
            .cloned())
    }

    async fn put(
        &self,
        table: &TableSpec,
        item: Item,
        condition: Option<Condition>,
    ) -> StoreResult<()> {
        let key = table
            .key_of(&item)
            .ok_or_else(|| StoreError::Malformed(format!("missing hash key {}", table.hash_key)))?
            .to_string();

        self.with_table(table, |t| {
            check(condition.as_ref(), t.rows.get(&key))?;
            t.rows.insert(key, item);
            Ok(())
        })
    }

    async fn update(
        &self,
        table: &TableSpec,
        key: &str,
        changes: Changes,
        condition: Option<Condition>,
    ) -> StoreResult<Item> {
        self.with_table(table, |t| {
            check(condition.as_ref(), t.rows.get(key))?;
            let row = t.rows.entry(key.to_string()).or_insert_with(|| {
                HashMap::from([(table.hash_key.to_string(), AttrValue::from(key))])
            });
            changes.apply_to(row);
            Ok(row.clone())
        })
    }

    async fn delete(&self, table: &TableSpec, key: &str) -> StoreResult<()> {
        if let Some(t) = self.tables.write().get_mut(&table.name) {
            t.rows.remove(key);
        }
        Ok(())
    }

    async fn batch_delete(&self, table: &TableSpec, keys: &[String]) -> StoreResult<()> {
        if keys.len() > BATCH_WRITE_LIMIT {
            return Err(StoreError::BatchTooLarge {
                size: keys.len(),
                limit: BATCH_WRITE_LIMIT,
            });
        }
        if let Some(t) = self.tables.write().get_mut(&table.name) {
            for key in keys {
                t.rows.remove(key);
            }
        }
        Ok(())
    }

    async fn query(&self, table: &TableSpec, query: &IndexQuery<'_>) -> StoreResult<Vec<Item>> {
        let index = table.index(query.index).ok_or_else(|| {
            StoreError::Backend(format!("unknown index {} on {}", query.index, table.name))
        })?;
        let now = epoch_seconds();

        let tables = self.tables.read();
        let Some(t) = tables.get(&table.name) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<(&String, &Item)> = t
            .rows
            .iter()
            .filter(|(_, row)| {
                row.get(index.attribute).and_then(AttrValue::as_str) == Some(query.value)
            })
            .filter(|(_, row)| !query.live_only || table.is_live(row, now))
            .collect();
        // Stable order keeps limit-1 lookups deterministic.
        matches.sort_by(|a, b| a.0.cmp(b.0));

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matches
            .into_iter()
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }
}

/// Spawn a background task that reclaims expired rows every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<MemoryStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired rows");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Store reaper shutting down");
                    break;
                }
            }
        }
    });
}

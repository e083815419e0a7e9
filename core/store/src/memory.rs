//! In-memory record store for testing and development.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use satchel_common::conflict::{classify, is_tombstone, KEY_DELETED};
use satchel_common::record::{
    monotonic_now, KEY_DEVICE_ID, KEY_ID, KEY_LAST_MODIFIED, KEY_SYNC_STATUS,
};
use satchel_common::{Error, RecordStatus, Result, SyncConflict, SyncJson};

use crate::store::{ChangeSet, RecordStore, RecordWrite};

#[derive(Debug, Clone, Default)]
struct Inner {
    /// Live records and tombstones, by table then id.
    tables: HashMap<String, HashMap<String, SyncJson>>,
    /// Last synchronized snapshot per record, the common base for
    /// conflict classification.
    bases: HashMap<String, HashMap<String, SyncJson>>,
}

impl Inner {
    fn record_id(record: &SyncJson) -> Result<String> {
        record
            .get(KEY_ID)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidInput("Record is missing an id".to_string()))
    }

    fn insert(&mut self, table: &str, record: SyncJson) -> Result<()> {
        let id = Self::record_id(&record)?;
        let rows = self.tables.entry(table.to_string()).or_default();
        if rows.get(&id).is_some_and(|r| !is_tombstone(r)) {
            return Err(Error::Storage(format!(
                "Record already exists: {table}/{id}"
            )));
        }
        rows.insert(id, record);
        Ok(())
    }

    fn update(&mut self, table: &str, record: SyncJson) -> Result<()> {
        let id = Self::record_id(&record)?;
        let rows = self.tables.entry(table.to_string()).or_default();
        match rows.get(&id) {
            Some(existing) if !is_tombstone(existing) => {
                rows.insert(id, record);
                Ok(())
            }
            _ => Err(Error::NotFound(format!("Record not found: {table}/{id}"))),
        }
    }

    fn delete(&mut self, table: &str, id: &str) -> Result<()> {
        let rows = self.tables.entry(table.to_string()).or_default();
        let Some(existing) = rows.get(id).filter(|r| !is_tombstone(r)) else {
            return Err(Error::NotFound(format!("Record not found: {table}/{id}")));
        };

        // Replace with a pending tombstone so the deletion syncs outward.
        let prev_modified = existing
            .get(KEY_LAST_MODIFIED)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let device = existing
            .get(KEY_DEVICE_ID)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut tombstone = SyncJson::new();
        tombstone.insert(KEY_ID.into(), json!(id));
        tombstone.insert(KEY_DELETED.into(), json!(true));
        tombstone.insert(KEY_LAST_MODIFIED.into(), json!(monotonic_now(prev_modified)));
        tombstone.insert(
            KEY_SYNC_STATUS.into(),
            json!(RecordStatus::Pending.as_str()),
        );
        tombstone.insert(KEY_DEVICE_ID.into(), json!(device));
        rows.insert(id.to_string(), tombstone);
        Ok(())
    }

    fn apply_write(&mut self, write: RecordWrite) -> Result<()> {
        match write {
            RecordWrite::Insert { table, record } => self.insert(&table, record),
            RecordWrite::Update { table, record } => self.update(&table, record),
            RecordWrite::Delete { table, id } => self.delete(&table, &id),
        }
    }
}

/// In-memory [`RecordStore`].
///
/// Useful for testing and development. All data is stored in memory and
/// lost on drop.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, table: &str, record: SyncJson) -> Result<()> {
        self.inner.write().unwrap().insert(table, record)
    }

    async fn get_by_id(&self, table: &str, id: &str) -> Result<Option<SyncJson>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .filter(|r| !is_tombstone(r))
            .cloned())
    }

    async fn list_all(&self, table: &str) -> Result<Vec<SyncJson>> {
        let inner = self.inner.read().unwrap();
        let mut records: Vec<SyncJson> = inner
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|r| !is_tombstone(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| {
            let key = |r: &SyncJson| {
                r.get(KEY_ID)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            key(a).cmp(&key(b))
        });
        Ok(records)
    }

    async fn update(&self, table: &str, record: SyncJson) -> Result<()> {
        self.inner.write().unwrap().update(table, record)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.inner.write().unwrap().delete(table, id)
    }

    async fn search(&self, table: &str, query: &str) -> Result<Vec<SyncJson>> {
        let needle = query.to_lowercase();
        let records = self.list_all(table).await?;
        Ok(records
            .into_iter()
            .filter(|record| {
                record.values().any(|value| {
                    value
                        .as_str()
                        .is_some_and(|s| s.to_lowercase().contains(&needle))
                })
            })
            .collect())
    }

    async fn changed_since(&self, since_ms: i64) -> Result<ChangeSet> {
        let inner = self.inner.read().unwrap();
        let mut changes = ChangeSet::new();
        for (table, rows) in &inner.tables {
            let mut changed: Vec<SyncJson> = rows
                .values()
                .filter(|record| {
                    record
                        .get(KEY_LAST_MODIFIED)
                        .and_then(Value::as_i64)
                        .unwrap_or(0)
                        > since_ms
                })
                .cloned()
                .collect();
            if !changed.is_empty() {
                changed.sort_by_key(|record| {
                    record
                        .get(KEY_LAST_MODIFIED)
                        .and_then(Value::as_i64)
                        .unwrap_or(0)
                });
                changes.insert(table.clone(), changed);
            }
        }
        Ok(changes)
    }

    async fn mark_synced(&self, table: &str, ids: &[String]) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        for id in ids {
            let Some(record) = inner
                .tables
                .get_mut(table)
                .and_then(|rows| rows.get_mut(id))
            else {
                continue;
            };

            if is_tombstone(record) {
                // A fully propagated deletion needs no further tracking.
                if let Some(rows) = inner.tables.get_mut(table) {
                    rows.remove(id);
                }
                if let Some(bases) = inner.bases.get_mut(table) {
                    bases.remove(id);
                }
                continue;
            }

            record.insert(
                KEY_SYNC_STATUS.into(),
                json!(RecordStatus::Synced.as_str()),
            );
            let snapshot = record.clone();
            inner
                .bases
                .entry(table.to_string())
                .or_default()
                .insert(id.clone(), snapshot);
        }
        Ok(())
    }

    async fn apply_remote_changes(&self, changes: ChangeSet) -> Result<Vec<SyncConflict>> {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let mut conflicts = Vec::new();
        let mut applied = 0usize;

        let mut tables: Vec<&String> = changes.keys().collect();
        tables.sort();

        for table in tables {
            for remote in &changes[table] {
                let record_id = remote
                    .get(KEY_ID)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let local = inner
                    .tables
                    .get(table.as_str())
                    .and_then(|rows| rows.get(&record_id))
                    .cloned();
                let has_base = inner
                    .bases
                    .get(table.as_str())
                    .is_some_and(|bases| bases.contains_key(&record_id));

                if let Some(conflict) =
                    classify(table, &record_id, local.as_ref(), Some(remote), has_base)?
                {
                    conflicts.push(conflict);
                    continue;
                }

                // Clean application: the remote copy becomes the
                // authoritative synced version.
                if is_tombstone(remote) {
                    if let Some(rows) = inner.tables.get_mut(table.as_str()) {
                        rows.remove(&record_id);
                    }
                    if let Some(bases) = inner.bases.get_mut(table.as_str()) {
                        bases.remove(&record_id);
                    }
                } else {
                    let mut record = remote.clone();
                    record.insert(
                        KEY_SYNC_STATUS.into(),
                        json!(RecordStatus::Synced.as_str()),
                    );
                    inner
                        .tables
                        .entry(table.clone())
                        .or_default()
                        .insert(record_id.clone(), record.clone());
                    inner
                        .bases
                        .entry(table.clone())
                        .or_default()
                        .insert(record_id, record);
                }
                applied += 1;
            }
        }

        debug!(applied, conflicts = conflicts.len(), "Applied remote change-set");
        Ok(conflicts)
    }

    async fn pending_changes_count(&self) -> Result<usize> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .tables
            .values()
            .flat_map(|rows| rows.values())
            .filter(|record| {
                record
                    .get(KEY_SYNC_STATUS)
                    .and_then(Value::as_str)
                    .is_some_and(|s| s == RecordStatus::Pending.as_str())
            })
            .count())
    }

    async fn in_transaction(&self, writes: Vec<RecordWrite>) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let snapshot = (*inner).clone();
        for write in writes {
            if let Err(err) = inner.apply_write(write) {
                *inner = snapshot;
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_common::ConflictType;

    fn record(id: &str, title: &str, modified_ms: i64) -> SyncJson {
        let mut map = SyncJson::new();
        map.insert(KEY_ID.into(), json!(id));
        map.insert("title".into(), json!(title));
        map.insert(KEY_LAST_MODIFIED.into(), json!(modified_ms));
        map.insert(KEY_SYNC_STATUS.into(), json!("pending"));
        map.insert(KEY_DEVICE_ID.into(), json!("device-a"));
        map
    }

    #[tokio::test]
    async fn insert_get_update_delete() {
        let store = MemoryStore::new();
        store.insert("notes", record("r1", "one", 1)).await.unwrap();

        let fetched = store.get_by_id("notes", "r1").await.unwrap().unwrap();
        assert_eq!(fetched["title"], json!("one"));

        store.update("notes", record("r1", "two", 2)).await.unwrap();
        let fetched = store.get_by_id("notes", "r1").await.unwrap().unwrap();
        assert_eq!(fetched["title"], json!("two"));

        store.delete("notes", "r1").await.unwrap();
        assert!(store.get_by_id("notes", "r1").await.unwrap().is_none());
        // Deletion leaves a pending tombstone for outward sync.
        assert_eq!(store.pending_changes_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        store.insert("notes", record("r1", "one", 1)).await.unwrap();
        assert!(store.insert("notes", record("r1", "again", 2)).await.is_err());
    }

    #[tokio::test]
    async fn changed_since_filters_by_timestamp() {
        let store = MemoryStore::new();
        store.insert("notes", record("r1", "old", 100)).await.unwrap();
        store.insert("notes", record("r2", "new", 200)).await.unwrap();

        let changes = store.changed_since(150).await.unwrap();
        assert_eq!(changes["notes"].len(), 1);
        assert_eq!(changes["notes"][0][KEY_ID], json!("r2"));
    }

    #[tokio::test]
    async fn mark_synced_clears_pending_and_sets_base() {
        let store = MemoryStore::new();
        store.insert("notes", record("r1", "one", 100)).await.unwrap();
        assert_eq!(store.pending_changes_count().await.unwrap(), 1);

        store.mark_synced("notes", &["r1".to_string()]).await.unwrap();
        assert_eq!(store.pending_changes_count().await.unwrap(), 0);

        // With a synced base, a both-sides edit now classifies as update.
        let mut remote = record("r1", "remote", 50);
        remote.insert(KEY_SYNC_STATUS.into(), json!("synced"));
        store.update("notes", record("r1", "local", 200)).await.unwrap();
        let conflicts = store
            .apply_remote_changes(ChangeSet::from([("notes".to_string(), vec![remote])]))
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::UpdateConflict);
    }

    #[tokio::test]
    async fn clean_remote_change_applies_as_synced() {
        let store = MemoryStore::new();
        let conflicts = store
            .apply_remote_changes(ChangeSet::from([(
                "notes".to_string(),
                vec![record("r1", "from remote", 100)],
            )]))
            .await
            .unwrap();
        assert!(conflicts.is_empty());

        let fetched = store.get_by_id("notes", "r1").await.unwrap().unwrap();
        assert_eq!(fetched[KEY_SYNC_STATUS], json!("synced"));
        assert_eq!(store.pending_changes_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn conflicting_remote_change_leaves_local_untouched() {
        let store = MemoryStore::new();
        store.insert("notes", record("r1", "local", 2_000)).await.unwrap();
        store.mark_synced("notes", &["r1".to_string()]).await.unwrap();
        store.update("notes", record("r1", "local edit", 3_000)).await.unwrap();

        let conflicts = store
            .apply_remote_changes(ChangeSet::from([(
                "notes".to_string(),
                vec![record("r1", "remote edit", 2_500)],
            )]))
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);

        let fetched = store.get_by_id("notes", "r1").await.unwrap().unwrap();
        assert_eq!(fetched["title"], json!("local edit"));
    }

    fn tombstone(id: &str, modified_ms: i64) -> SyncJson {
        let mut map = SyncJson::new();
        map.insert(KEY_ID.into(), json!(id));
        map.insert(KEY_DELETED.into(), json!(true));
        map.insert(KEY_LAST_MODIFIED.into(), json!(modified_ms));
        map
    }

    #[tokio::test]
    async fn remote_delete_of_unmodified_record_applies_cleanly() {
        let store = MemoryStore::new();
        store.insert("notes", record("r1", "synced", 1_000)).await.unwrap();
        store.mark_synced("notes", &["r1".to_string()]).await.unwrap();

        // Deleted on another device after our last edit.
        let conflicts = store
            .apply_remote_changes(ChangeSet::from([(
                "notes".to_string(),
                vec![tombstone("r1", 2_000)],
            )]))
            .await
            .unwrap();

        assert!(conflicts.is_empty());
        assert!(store.get_by_id("notes", "r1").await.unwrap().is_none());
        assert_eq!(store.pending_changes_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remote_delete_of_pending_local_record_conflicts_instead_of_erasing() {
        let store = MemoryStore::new();
        // Created locally, never pushed.
        store.insert("notes", record("r1", "unsynced work", 1_000)).await.unwrap();

        let conflicts = store
            .apply_remote_changes(ChangeSet::from([(
                "notes".to_string(),
                vec![tombstone("r1", 2_000)],
            )]))
            .await
            .unwrap();

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::DeleteConflict);
        let kept = store.get_by_id("notes", "r1").await.unwrap().unwrap();
        assert_eq!(kept["title"], json!("unsynced work"));
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let store = MemoryStore::new();
        store.insert("notes", record("r1", "one", 1)).await.unwrap();

        let result = store
            .in_transaction(vec![
                RecordWrite::Insert {
                    table: "notes".to_string(),
                    record: record("r2", "two", 2),
                },
                RecordWrite::Update {
                    table: "notes".to_string(),
                    record: record("missing", "nope", 3),
                },
            ])
            .await;

        assert!(result.is_err());
        // The successful insert from the failed batch is rolled back.
        assert!(store.get_by_id("notes", "r2").await.unwrap().is_none());
        assert!(store.get_by_id("notes", "r1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn search_matches_substrings_case_insensitively() {
        let store = MemoryStore::new();
        store.insert("notes", record("r1", "Grocery list", 1)).await.unwrap();
        store.insert("notes", record("r2", "workout", 2)).await.unwrap();

        let hits = store.search("notes", "grocery").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0][KEY_ID], json!("r1"));
    }
}

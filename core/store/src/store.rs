//! Record store trait definition.

use async_trait::async_trait;
use std::collections::HashMap;

use satchel_common::{Result, SyncConflict, SyncJson};

/// A change-set: serialized records grouped by table name.
pub type ChangeSet = HashMap<String, Vec<SyncJson>>;

/// One write in a transactional batch.
#[derive(Debug, Clone)]
pub enum RecordWrite {
    Insert { table: String, record: SyncJson },
    Update { table: String, record: SyncJson },
    Delete { table: String, id: String },
}

/// On-device relational store boundary.
///
/// The sync engine only sees records as flat sync-JSON snapshots; schema
/// and query details stay behind this trait. Implementations must keep
/// deletion tombstones so that local deletes can be pushed and can collide
/// with remote updates.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record.
    ///
    /// # Errors
    /// - A record with the same id already exists in the table
    async fn insert(&self, table: &str, record: SyncJson) -> Result<()>;

    /// Fetch a record by id. Returns `None` for missing or deleted records.
    async fn get_by_id(&self, table: &str, id: &str) -> Result<Option<SyncJson>>;

    /// List all live records in a table.
    async fn list_all(&self, table: &str) -> Result<Vec<SyncJson>>;

    /// Update an existing record.
    ///
    /// # Errors
    /// - Record not found
    async fn update(&self, table: &str, record: SyncJson) -> Result<()>;

    /// Delete a record, leaving a pending tombstone for outward sync.
    async fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// Search live records by substring across string fields.
    async fn search(&self, table: &str, query: &str) -> Result<Vec<SyncJson>>;

    /// Records (including tombstones) modified after `since_ms`, per table.
    async fn changed_since(&self, since_ms: i64) -> Result<ChangeSet>;

    /// Mark records as synced and remember their snapshots as the new
    /// common base for conflict detection.
    async fn mark_synced(&self, table: &str, ids: &[String]) -> Result<()>;

    /// Apply a remote change-set.
    ///
    /// Each incoming record either applies cleanly (overwriting local,
    /// marked synced) or diverges from a newer local edit, in which case
    /// the local copy is left untouched and a [`SyncConflict`] is returned
    /// for the resolver.
    async fn apply_remote_changes(&self, changes: ChangeSet) -> Result<Vec<SyncConflict>>;

    /// Number of records (including tombstones) awaiting outward sync.
    async fn pending_changes_count(&self) -> Result<usize>;

    /// Apply a batch of writes atomically; on any failure the store is
    /// rolled back to its state before the batch.
    async fn in_transaction(&self, writes: Vec<RecordWrite>) -> Result<()>;
}

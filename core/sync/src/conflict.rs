//! Conflict resolution application.
//!
//! Divergence detection/classification lives in `satchel_common::conflict`
//! so store backends can produce [`SyncConflict`]s; this module applies a
//! chosen [`ConflictResolution`] against the local store. Application is
//! idempotent: applying the same resolution twice leaves state unchanged
//! after the first application.

use serde_json::json;
use tracing::info;

use satchel_common::record::{KEY_ID, KEY_SYNC_STATUS};
use satchel_common::{
    ConflictResolution, Error, RecordStatus, ResolutionStrategy, Result, SyncConflict, SyncJson,
};
use satchel_store::RecordStore;

/// Applies resolutions to the local store.
pub struct ConflictResolver {
    default_strategy: ResolutionStrategy,
}

impl ConflictResolver {
    pub fn new(default_strategy: ResolutionStrategy) -> Self {
        Self { default_strategy }
    }

    pub fn default_strategy(&self) -> ResolutionStrategy {
        self.default_strategy
    }

    /// Apply `resolution` to `conflict`.
    ///
    /// Returns whether the conflict is settled: `Manual` defers action and
    /// leaves it outstanding until a resolution of another strategy is
    /// supplied later.
    pub async fn resolve(
        &self,
        store: &dyn RecordStore,
        conflict: &SyncConflict,
        resolution: &ConflictResolution,
    ) -> Result<bool> {
        if resolution.conflict_id != conflict.id {
            return Err(Error::InvalidInput(format!(
                "Resolution targets conflict {} but {} was supplied",
                resolution.conflict_id, conflict.id
            )));
        }

        let table = conflict.table_name.as_str();
        let record_id = conflict.record_id.as_str();

        match resolution.strategy {
            ResolutionStrategy::UseLocal => {
                match &conflict.local_data {
                    // Republish the local snapshot as authoritative and
                    // mark it for outward sync.
                    Some(local) => upsert_pending(store, table, local.clone()).await?,
                    // Local side was a deletion; keep it pending outward.
                    None => delete_if_present(store, table, record_id).await?,
                }
            }
            ResolutionStrategy::UseRemote => {
                match &conflict.remote_data {
                    Some(remote) => {
                        upsert_pending(store, table, remote.clone()).await?;
                        store.mark_synced(table, &[record_id.to_string()]).await?;
                    }
                    // Remote side was a deletion; adopt it fully.
                    None => {
                        delete_if_present(store, table, record_id).await?;
                        store.mark_synced(table, &[record_id.to_string()]).await?;
                    }
                }
            }
            ResolutionStrategy::Merge => {
                // The merged payload is an external input; nothing here
                // computes a field merge.
                let merged = resolution.resolved_data.clone().ok_or_else(|| {
                    Error::InvalidInput(
                        "Merge resolution requires resolved_data".to_string(),
                    )
                })?;
                upsert_pending(store, table, merged).await?;
            }
            ResolutionStrategy::Manual => {
                info!(conflict_id = %conflict.id, "Conflict deferred to manual resolution");
                return Ok(false);
            }
        }

        info!(
            conflict_id = %conflict.id,
            strategy = ?resolution.strategy,
            "Conflict resolved"
        );
        Ok(true)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolutionStrategy::Manual)
    }
}

/// Write a snapshot marked pending, inserting or updating as needed.
async fn upsert_pending(store: &dyn RecordStore, table: &str, mut record: SyncJson) -> Result<()> {
    record.insert(
        KEY_SYNC_STATUS.into(),
        json!(RecordStatus::Pending.as_str()),
    );
    let id = record
        .get(KEY_ID)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput("Resolution payload is missing an id".to_string()))?;

    if store.get_by_id(table, &id).await?.is_some() {
        store.update(table, record).await
    } else {
        store.insert(table, record).await
    }
}

/// Delete a record, ignoring the case where it is already gone.
async fn delete_if_present(store: &dyn RecordStore, table: &str, id: &str) -> Result<()> {
    match store.delete(table, id).await {
        Ok(()) => Ok(()),
        Err(Error::NotFound(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

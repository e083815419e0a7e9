//! Conflict data model and deterministic divergence classification.
//!
//! Classification is a pure function over a pair of record snapshots, so
//! any store backend can produce conflicts while applying a remote
//! change-set. Resolution application lives in the sync crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{SyncJson, KEY_DEVICE_ID, KEY_ID, KEY_LAST_MODIFIED, KEY_SYNC_STATUS};
use crate::Result;

/// Marker key on a snapshot representing a deletion tombstone.
pub const KEY_DELETED: &str = "deleted";

/// Description prefix for conflicts that must not be auto-resolved.
pub const MANUAL_RESOLUTION_REQUIRED: &str = "manual resolution required";

/// Nature of a detected divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides updated the record since the last common sync.
    UpdateConflict,
    /// One side deleted while the other updated.
    DeleteConflict,
    /// Both sides created a record with a colliding id.
    CreateConflict,
}

/// A record edited independently on two or more devices since their last
/// common synchronized state. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    /// Local snapshot; `None` when the record was deleted locally.
    pub local_data: Option<SyncJson>,
    /// Remote snapshot; `None` when the record was deleted remotely.
    pub remote_data: Option<SyncJson>,
    #[serde(rename = "conflict_timestamp")]
    pub conflict_time: DateTime<Utc>,
    #[serde(rename = "conflict_type")]
    pub conflict_type: ConflictType,
    pub description: String,
}

impl SyncConflict {
    /// Whether this conflict was flagged as requiring manual resolution.
    pub fn requires_manual(&self) -> bool {
        self.description.starts_with(MANUAL_RESOLUTION_REQUIRED)
    }
}

/// Policy chosen to reconcile a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Republish the local snapshot as authoritative.
    UseLocal,
    /// Overwrite local fields with the remote snapshot.
    UseRemote,
    /// Record an externally supplied merged payload.
    Merge,
    /// Defer automatic action; conflict remains outstanding.
    Manual,
}

/// A recorded decision reconciling one [`SyncConflict`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: String,
    pub strategy: ResolutionStrategy,
    /// Required for `Merge`; ignored otherwise.
    pub resolved_data: Option<SyncJson>,
    pub resolution_time: DateTime<Utc>,
    pub notes: Option<String>,
}

impl ConflictResolution {
    pub fn new(conflict_id: impl Into<String>, strategy: ResolutionStrategy) -> Self {
        Self {
            conflict_id: conflict_id.into(),
            strategy,
            resolved_data: None,
            resolution_time: Utc::now(),
            notes: None,
        }
    }

    pub fn with_resolved_data(mut self, data: SyncJson) -> Self {
        self.resolved_data = Some(data);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Whether a snapshot is a deletion tombstone.
pub fn is_tombstone(snapshot: &SyncJson) -> bool {
    snapshot
        .get(KEY_DELETED)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Compare the content fields of two snapshots, ignoring sync metadata
/// (`last_modified`, `sync_status`, `device_id`).
pub fn content_differs(a: &SyncJson, b: &SyncJson) -> bool {
    let is_meta =
        |key: &str| matches!(key, KEY_LAST_MODIFIED | KEY_SYNC_STATUS | KEY_DEVICE_ID);

    let keys: std::collections::BTreeSet<&String> = a
        .keys()
        .chain(b.keys())
        .filter(|k| !is_meta(k.as_str()))
        .collect();

    keys.into_iter()
        .any(|key| a.get(key.as_str()) != b.get(key.as_str()))
}

fn snapshot_modified_ms(snapshot: &SyncJson) -> Option<i64> {
    snapshot.get(KEY_LAST_MODIFIED).and_then(serde_json::Value::as_i64)
}

fn well_formed(snapshot: &SyncJson) -> bool {
    snapshot
        .get(KEY_ID)
        .and_then(serde_json::Value::as_str)
        .is_some()
        && snapshot_modified_ms(snapshot).is_some()
}

fn conflict(
    table: &str,
    record_id: &str,
    local: Option<&SyncJson>,
    remote: Option<&SyncJson>,
    conflict_type: ConflictType,
    description: String,
) -> SyncConflict {
    SyncConflict {
        id: Uuid::new_v4().to_string(),
        table_name: table.to_string(),
        record_id: record_id.to_string(),
        local_data: local.cloned(),
        remote_data: remote.cloned(),
        conflict_time: Utc::now(),
        conflict_type,
        description,
    }
}

/// Classify a local/remote snapshot pair while applying a remote change.
///
/// Returns `None` when the remote change can be applied without divergence.
/// `has_synced_base` tells whether the store ever held a synchronized
/// version of this record; without one, a colliding pair is a
/// create/create collision rather than an update race.
///
/// Deterministic: the same snapshots and timestamps classify identically on
/// every run. Malformed snapshots are never auto-resolved; they classify as
/// a conflict flagged [`MANUAL_RESOLUTION_REQUIRED`].
pub fn classify(
    table: &str,
    record_id: &str,
    local: Option<&SyncJson>,
    remote: Option<&SyncJson>,
    has_synced_base: bool,
) -> Result<Option<SyncConflict>> {
    let local = local.filter(|s| !is_tombstone(s));
    let remote_tombstone = remote.filter(|s| is_tombstone(s));
    let remote = remote.filter(|s| !is_tombstone(s));

    // Malformed snapshot data: flag for manual resolution, never guess.
    let malformed =
        local.is_some_and(|s| !well_formed(s)) || remote.is_some_and(|s| !well_formed(s));
    if malformed {
        return Ok(Some(conflict(
            table,
            record_id,
            local,
            remote,
            ConflictType::UpdateConflict,
            format!("{MANUAL_RESOLUTION_REQUIRED}: malformed snapshot for {record_id}"),
        )));
    }

    match (local, remote) {
        (Some(local), Some(remote)) => {
            let local_ms = snapshot_modified_ms(local).unwrap_or(0);
            let remote_ms = snapshot_modified_ms(remote).unwrap_or(0);

            if !content_differs(local, remote) {
                // Same content on both sides, nothing to reconcile.
                return Ok(None);
            }
            if local_ms <= remote_ms {
                // Local is not newer than the remote's base point; the
                // remote change applies cleanly.
                return Ok(None);
            }

            let (conflict_type, what) = if has_synced_base {
                (ConflictType::UpdateConflict, "updated on both sides")
            } else {
                (ConflictType::CreateConflict, "created on both sides")
            };
            Ok(Some(conflict(
                table,
                record_id,
                Some(local),
                Some(remote),
                conflict_type,
                format!("{record_id} {what} since last sync"),
            )))
        }
        (Some(local), None) if remote_tombstone.is_some() => {
            // A never-synchronized local record cannot be covered by the
            // remote deletion; erasing it would lose unpushed data.
            if !has_synced_base {
                return Ok(Some(conflict(
                    table,
                    record_id,
                    Some(local),
                    None,
                    ConflictType::DeleteConflict,
                    format!("{record_id} deleted remotely but the local copy was never pushed"),
                )));
            }

            let local_ms = snapshot_modified_ms(local).unwrap_or(0);
            let deleted_ms = remote_tombstone
                .and_then(snapshot_modified_ms)
                .unwrap_or(0);
            // Same clean-apply rule as the update arm: only a local edit
            // postdating the deletion diverges.
            if local_ms > deleted_ms {
                Ok(Some(conflict(
                    table,
                    record_id,
                    Some(local),
                    None,
                    ConflictType::DeleteConflict,
                    format!("{record_id} deleted remotely but updated locally"),
                )))
            } else {
                Ok(None)
            }
        }
        (None, Some(remote)) if has_synced_base => {
            // Deleted locally while updated remotely.
            Ok(Some(conflict(
                table,
                record_id,
                None,
                Some(remote),
                ConflictType::DeleteConflict,
                format!("{record_id} deleted locally but updated remotely"),
            )))
        }
        _ => Ok(None),
    }
}

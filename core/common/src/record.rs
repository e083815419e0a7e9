//! Record model and the "sync JSON" serialization conventions.
//!
//! Every record kind that participates in sync serializes to a flat
//! snake_case key-value map. `last_modified` travels as epoch milliseconds;
//! all other date/time fields travel as ISO-8601 strings. Numeric amount
//! fields accept integer or floating input and normalize to `f64`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Flat key-value snapshot of a record, as exchanged with the store and
/// the cloud transport.
pub type SyncJson = Map<String, Value>;

/// Key holding the record identity.
pub const KEY_ID: &str = "id";
/// Key holding the last-modified timestamp (epoch milliseconds).
pub const KEY_LAST_MODIFIED: &str = "last_modified";
/// Key holding the outward sync status.
pub const KEY_SYNC_STATUS: &str = "sync_status";
/// Key holding the device that made the last local write.
pub const KEY_DEVICE_ID: &str = "device_id";

/// Sync metadata status of a record.
///
/// Metadata only: record identity and content equality are by `id` alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Local changes not yet pushed.
    #[default]
    Pending,
    /// In sync with the remote store.
    Synced,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "synced" => Ok(RecordStatus::Synced),
            other => Err(Error::InvalidInput(format!(
                "Unknown sync status: {other}"
            ))),
        }
    }
}

/// Abstract shape shared by every concrete record kind.
///
/// `last_modified` is advanced on every local mutation and never backdated;
/// `sync_status` and `device_id` are metadata and do not participate in
/// content equality.
pub trait Syncable: Sized {
    /// Table this record kind lives in.
    fn table() -> &'static str;

    /// Record identity; equality for sync purposes is by id alone.
    fn id(&self) -> &str;

    /// Last local mutation time, epoch milliseconds.
    fn last_modified_ms(&self) -> i64;

    /// Outward sync status.
    fn sync_status(&self) -> RecordStatus;

    /// Device that made the last local write.
    fn device_id(&self) -> &str;

    /// Record a local mutation: advance `last_modified` to now (never
    /// backdated), mark pending, stamp the writing device.
    fn touch(&mut self, device_id: &str);

    /// Serialize to sync JSON.
    fn to_sync_json(&self) -> Result<SyncJson>;

    /// Deserialize from sync JSON.
    ///
    /// Trusts the payload's own `sync_status`/`device_id` metadata rather
    /// than preserving any prior in-memory values.
    fn from_sync_json(json: &SyncJson) -> Result<Self>;
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Advance a last-modified timestamp to now without ever backdating it.
pub fn monotonic_now(prev_ms: i64) -> i64 {
    now_ms().max(prev_ms)
}

/// Format a datetime as ISO-8601 for sync JSON.
pub fn to_iso8601(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 datetime from sync JSON.
pub fn parse_iso8601(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("Invalid ISO-8601 timestamp {s:?}: {e}")))
}

/// Normalize a numeric amount field: integer or floating input, `f64` out.
pub fn normalize_amount(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| Error::Serialization(format!("Amount is not numeric: {value}")))
}

/// Read a required string field from sync JSON.
pub fn json_str(json: &SyncJson, key: &str) -> Result<String> {
    json.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Serialization(format!("Missing or non-string field: {key}")))
}

/// Read the `last_modified` epoch-millisecond field from sync JSON.
pub fn json_last_modified(json: &SyncJson) -> Result<i64> {
    json.get(KEY_LAST_MODIFIED)
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            Error::Serialization(format!(
                "Missing or non-integer field: {KEY_LAST_MODIFIED}"
            ))
        })
}

//! Sync lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use satchel_common::{Error, Result};

use crate::events::EventBus;

/// Lifecycle status of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    BackingUp,
    Restoring,
    Error,
}

/// An active (non-idle) engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Sync,
    Backup,
    Restore,
}

impl Activity {
    fn status(self) -> SyncStatus {
        match self {
            Activity::Sync => SyncStatus::Syncing,
            Activity::Backup => SyncStatus::BackingUp,
            Activity::Restore => SyncStatus::Restoring,
        }
    }
}

/// Observable snapshot of the engine lifecycle.
///
/// The only channel through which sync progress is observed; exactly one
/// is live per device process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub status: SyncStatus,
    /// Only meaningful while an activity is running; monotonically
    /// non-decreasing within one operation.
    pub progress: Option<f64>,
    pub current_operation: Option<String>,
    pub pending_changes: usize,
    /// Unresolved conflict ids, in detection order.
    pub conflicts: Vec<String>,
    pub error_message: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_backup_time: Option<DateTime<Utc>>,
}

impl SyncState {
    fn new() -> Self {
        Self {
            status: SyncStatus::Idle,
            progress: None,
            current_operation: None,
            pending_changes: 0,
            conflicts: Vec::new(),
            error_message: None,
            last_sync_time: None,
            last_backup_time: None,
        }
    }

    /// Manual sync is offered whenever the engine is idle, regardless of
    /// pending changes.
    pub fn can_start_manual_sync(&self) -> bool {
        self.status == SyncStatus::Idle
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// State machine guarding the sync lifecycle.
///
/// Transitions: `idle ⇄ syncing|backingUp|restoring`; any active state may
/// fail into `error`, which is exited only by an explicit acknowledgement.
/// At most one activity is active at a time.
pub struct SyncStateMachine {
    state: RwLock<SyncState>,
    bus: EventBus<SyncState>,
}

impl SyncStateMachine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SyncState::new()),
            bus: EventBus::new(),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> SyncState {
        self.state.read().unwrap().clone()
    }

    /// Subscribe to state-change snapshots.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncState> {
        self.bus.subscribe()
    }

    fn mutate<F: FnOnce(&mut SyncState) -> Result<()>>(&self, f: F) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write().unwrap();
            f(&mut state)?;
            state.clone()
        };
        self.bus.publish(snapshot);
        Ok(())
    }

    /// Start an activity. Rejected unless the machine is idle.
    pub fn begin(&self, activity: Activity, operation: impl Into<String>) -> Result<()> {
        let operation = operation.into();
        self.mutate(|state| {
            if state.status != SyncStatus::Idle {
                return Err(Error::State(format!(
                    "Cannot start {operation}: engine is {:?}",
                    state.status
                )));
            }
            state.status = activity.status();
            state.progress = Some(0.0);
            state.current_operation = Some(operation);
            Ok(())
        })
    }

    /// Advance progress within the active operation.
    ///
    /// Values are clamped to `[0, 1]` and never decrease; a stale lower
    /// report is ignored rather than rewound.
    pub fn set_progress(&self, progress: f64) -> Result<()> {
        self.mutate(|state| {
            if !matches!(
                state.status,
                SyncStatus::Syncing | SyncStatus::BackingUp | SyncStatus::Restoring
            ) {
                return Err(Error::State(
                    "Progress is only meaningful in an active state".to_string(),
                ));
            }
            let clamped = progress.clamp(0.0, 1.0);
            let current = state.progress.unwrap_or(0.0);
            state.progress = Some(clamped.max(current));
            Ok(())
        })
    }

    /// Finish the active operation and return to idle.
    pub fn complete(&self, activity: Activity) -> Result<()> {
        self.mutate(|state| {
            if state.status != activity.status() {
                return Err(Error::State(format!(
                    "Cannot complete {activity:?}: engine is {:?}",
                    state.status
                )));
            }
            state.status = SyncStatus::Idle;
            state.progress = None;
            state.current_operation = None;
            state.error_message = None;
            let now = Utc::now();
            match activity {
                Activity::Sync | Activity::Restore => state.last_sync_time = Some(now),
                Activity::Backup => state.last_backup_time = Some(now),
            }
            Ok(())
        })
    }

    /// Abandon the active operation and enter the error state.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let result = self.mutate(|state| {
            if !matches!(
                state.status,
                SyncStatus::Syncing | SyncStatus::BackingUp | SyncStatus::Restoring
            ) {
                return Err(Error::State(format!(
                    "Failure reported while {:?}",
                    state.status
                )));
            }
            state.status = SyncStatus::Error;
            state.progress = None;
            state.current_operation = None;
            state.error_message = Some(message.clone());
            Ok(())
        });
        if let Err(err) = result {
            warn!("Dropped failure signal: {err}");
        }
    }

    /// Explicitly acknowledge an error and return to idle.
    pub fn acknowledge_error(&self) -> Result<()> {
        self.mutate(|state| {
            if state.status != SyncStatus::Error {
                return Err(Error::State("No error to acknowledge".to_string()));
            }
            state.status = SyncStatus::Idle;
            state.error_message = None;
            Ok(())
        })
    }

    /// Recompute the pending-change count after local mutations or a
    /// completed pass.
    pub fn set_pending_changes(&self, count: usize) {
        let _ = self.mutate(|state| {
            state.pending_changes = count;
            Ok(())
        });
    }

    /// Append newly detected conflict ids.
    pub fn add_conflicts(&self, ids: impl IntoIterator<Item = String>) {
        let _ = self.mutate(|state| {
            for id in ids {
                if !state.conflicts.contains(&id) {
                    state.conflicts.push(id);
                }
            }
            Ok(())
        });
    }

    /// Drop a conflict id once its resolution has been applied.
    pub fn remove_conflict(&self, id: &str) {
        let _ = self.mutate(|state| {
            state.conflicts.retain(|c| c != id);
            Ok(())
        });
    }
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

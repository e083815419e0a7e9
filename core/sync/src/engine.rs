//! Sync engine: pull/push passes, backup and restore.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use satchel_common::record::{KEY_ID, KEY_SYNC_STATUS};
use satchel_common::{
    ConflictResolution, Error, RecordStatus, ResolutionStrategy, Result, SyncConflict,
};
use satchel_store::{ChangeSet, CloudTransport, RecordStore};

use crate::conflict::ConflictResolver;
use crate::scheduler::SyncInvoker;
use crate::state::{Activity, SyncStateMachine};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts per queued network operation before it is dropped.
    pub max_retries: u32,
    /// Restrict sync-dependent work to wifi links.
    pub wifi_preferred: bool,
    /// Strategy suggested for conflicts that arrive without one.
    pub default_strategy: ResolutionStrategy,
    /// Force the battery-optimized scheduling cadence regardless of what
    /// the platform probe reports.
    pub battery_optimized_override: Option<bool>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            wifi_preferred: false,
            default_strategy: ResolutionStrategy::Manual,
            battery_optimized_override: None,
        }
    }
}

/// Outcome of one completed sync pass.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub pulled: usize,
    pub pushed: usize,
    pub conflicts_found: usize,
    pub duration: Duration,
}

/// Orchestrates sync, backup and restore passes over a store and a
/// transport, reporting through a [`SyncStateMachine`].
pub struct SyncEngine<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    state: Arc<SyncStateMachine>,
    resolver: ConflictResolver,
    /// Unresolved conflicts by conflict id.
    conflicts: Mutex<HashMap<String, SyncConflict>>,
    config: SyncConfig,
}

impl<S: RecordStore, T: CloudTransport> SyncEngine<S, T> {
    pub fn new(store: Arc<S>, transport: Arc<T>, config: SyncConfig) -> Self {
        let resolver = ConflictResolver::new(config.default_strategy);
        Self {
            store,
            transport,
            state: Arc::new(SyncStateMachine::new()),
            resolver,
            conflicts: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Best-effort transport initialization. A failing transport must not
    /// abort startup; the first sync pass will surface the error instead.
    pub async fn initialize(&self) {
        if let Err(err) = self.transport.initialize().await {
            warn!(
                transport = self.transport.name(),
                "Transport initialization failed, continuing: {err}"
            );
        }
    }

    pub fn state(&self) -> Arc<SyncStateMachine> {
        Arc::clone(&self.state)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Unresolved conflicts, in no particular order.
    pub fn pending_conflicts(&self) -> Vec<SyncConflict> {
        self.conflicts.lock().unwrap().values().cloned().collect()
    }

    /// Run one full sync pass.
    ///
    /// Rejected while another activity is running. Any mid-pass failure
    /// transitions to the error state; the engine is never left reporting
    /// `syncing` after this returns.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.state.begin(Activity::Sync, "sync")?;
        match self.sync_pass().await {
            Ok(report) => {
                self.state.complete(Activity::Sync)?;
                info!(
                    pulled = report.pulled,
                    pushed = report.pushed,
                    conflicts = report.conflicts_found,
                    "Sync pass complete"
                );
                Ok(report)
            }
            Err(err) => {
                self.state.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn sync_pass(&self) -> Result<SyncReport> {
        let started = Instant::now();
        let since_ms = self
            .state
            .snapshot()
            .last_sync_time
            .map(|t| t.timestamp_millis())
            .unwrap_or(0);

        // Pull first so local pending edits can collide with fresher
        // remote copies before we push.
        let remote = self.transport.fetch_changes(since_ms).await?;
        let pulled = remote.values().map(Vec::len).sum();
        self.state.set_progress(0.25)?;

        let found = self.store.apply_remote_changes(remote).await?;
        let conflicts_found = found.len();
        if conflicts_found > 0 {
            let ids: Vec<String> = found.iter().map(|c| c.id.clone()).collect();
            let mut conflicts = self.conflicts.lock().unwrap();
            for conflict in found {
                conflicts.insert(conflict.id.clone(), conflict);
            }
            drop(conflicts);
            self.state.add_conflicts(ids);
        }
        self.state.set_progress(0.5)?;

        let outgoing = self.outgoing_changes(since_ms).await?;
        let pushed = outgoing.values().map(Vec::len).sum();
        if pushed > 0 {
            self.transport.push_changes(outgoing.clone()).await?;
            for (table, records) in &outgoing {
                let ids: Vec<String> = records
                    .iter()
                    .filter_map(|r| r.get(KEY_ID).and_then(Value::as_str))
                    .map(str::to_string)
                    .collect();
                self.store.mark_synced(table, &ids).await?;
            }
        }
        self.state.set_progress(0.9)?;

        let pending = self.store.pending_changes_count().await?;
        self.state.set_pending_changes(pending);

        Ok(SyncReport {
            pulled,
            pushed,
            conflicts_found,
            duration: started.elapsed(),
        })
    }

    /// Local changes to push: pending records modified since the last
    /// pass, minus anything currently in conflict.
    async fn outgoing_changes(&self, since_ms: i64) -> Result<ChangeSet> {
        let conflicted: Vec<(String, String)> = {
            let conflicts = self.conflicts.lock().unwrap();
            conflicts
                .values()
                .map(|c| (c.table_name.clone(), c.record_id.clone()))
                .collect()
        };

        let mut outgoing = self.store.changed_since(since_ms).await?;
        for (table, records) in &mut outgoing {
            records.retain(|record| {
                let pending = record
                    .get(KEY_SYNC_STATUS)
                    .and_then(Value::as_str)
                    .is_some_and(|s| s == RecordStatus::Pending.as_str());
                let in_conflict = record
                    .get(KEY_ID)
                    .and_then(Value::as_str)
                    .is_some_and(|id| {
                        conflicted
                            .iter()
                            .any(|(t, r)| t == table && r == id)
                    });
                pending && !in_conflict
            });
        }
        outgoing.retain(|_, records| !records.is_empty());
        Ok(outgoing)
    }

    /// Serialize the full store contents and upload them as one backup
    /// payload.
    pub async fn backup(&self) -> Result<()> {
        self.state.begin(Activity::Backup, "backup")?;
        match self.backup_pass().await {
            Ok(()) => {
                self.state.complete(Activity::Backup)?;
                info!("Backup complete");
                Ok(())
            }
            Err(err) => {
                self.state.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn backup_pass(&self) -> Result<()> {
        let contents = self.store.changed_since(0).await?;
        self.state.set_progress(0.5)?;
        let payload = serde_json::to_vec(&contents)
            .map_err(|err| Error::Serialization(err.to_string()))?;
        self.transport.upload_backup(payload).await
    }

    /// Download the latest backup and apply it as a remote change-set.
    ///
    /// Divergent local edits surface as conflicts exactly as they would
    /// during a sync pass.
    pub async fn restore(&self) -> Result<()> {
        self.state.begin(Activity::Restore, "restore")?;
        match self.restore_pass().await {
            Ok(()) => {
                self.state.complete(Activity::Restore)?;
                info!("Restore complete");
                Ok(())
            }
            Err(err) => {
                self.state.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn restore_pass(&self) -> Result<()> {
        let payload = self.transport.download_backup().await?;
        self.state.set_progress(0.3)?;
        let contents: ChangeSet = serde_json::from_slice(&payload)
            .map_err(|err| Error::Serialization(err.to_string()))?;

        let found = self.store.apply_remote_changes(contents).await?;
        if !found.is_empty() {
            let ids: Vec<String> = found.iter().map(|c| c.id.clone()).collect();
            let mut conflicts = self.conflicts.lock().unwrap();
            for conflict in found {
                conflicts.insert(conflict.id.clone(), conflict);
            }
            drop(conflicts);
            self.state.add_conflicts(ids);
        }
        self.state.set_progress(0.9)?;

        let pending = self.store.pending_changes_count().await?;
        self.state.set_pending_changes(pending);
        Ok(())
    }

    /// Apply a resolution to an outstanding conflict.
    ///
    /// Settled conflicts are dropped from the engine and the observable
    /// state; `Manual` resolutions leave the conflict outstanding.
    pub async fn resolve_conflict(&self, resolution: &ConflictResolution) -> Result<bool> {
        let conflict = {
            let conflicts = self.conflicts.lock().unwrap();
            conflicts.get(&resolution.conflict_id).cloned()
        }
        .ok_or_else(|| {
            Error::NotFound(format!("Unknown conflict: {}", resolution.conflict_id))
        })?;

        let settled = self
            .resolver
            .resolve(self.store.as_ref(), &conflict, resolution)
            .await?;
        if settled {
            self.conflicts.lock().unwrap().remove(&conflict.id);
            self.state.remove_conflict(&conflict.id);
            let pending = self.store.pending_changes_count().await?;
            self.state.set_pending_changes(pending);
        }
        Ok(settled)
    }
}

#[async_trait]
impl<S: RecordStore + 'static, T: CloudTransport + 'static> SyncInvoker for SyncEngine<S, T> {
    async fn run_sync(&self) -> Result<()> {
        self.sync().await.map(|_| ())
    }
}

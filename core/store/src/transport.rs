//! Cloud transport trait definition.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};

use satchel_common::{Error, Result};

use crate::store::ChangeSet;

/// Cloud transport boundary.
///
/// Opaque to the sync core: it moves change-sets and backup payloads and
/// nothing else. Implementations own authentication, timeouts and rate
/// limiting; the core only enforces retry-count limits.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    /// Transport name (e.g. "drive", "memory").
    fn name(&self) -> &str;

    /// Best-effort initialization.
    ///
    /// Failure must not abort the owning process startup; callers log and
    /// continue.
    async fn initialize(&self) -> Result<()>;

    /// Fetch remote records changed after `since_ms`, per table.
    async fn fetch_changes(&self, since_ms: i64) -> Result<ChangeSet>;

    /// Push local changes to the remote store.
    async fn push_changes(&self, changes: ChangeSet) -> Result<()>;

    /// Upload a full backup payload.
    async fn upload_backup(&self, payload: Vec<u8>) -> Result<()>;

    /// Download the latest backup payload.
    ///
    /// # Errors
    /// - No backup exists
    async fn download_backup(&self) -> Result<Vec<u8>>;
}

#[derive(Debug, Default)]
struct TransportInner {
    remote_changes: ChangeSet,
    pushed: Vec<ChangeSet>,
    backup: Option<Vec<u8>>,
    fail_next: bool,
}

/// In-memory [`CloudTransport`] for testing and development.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<RwLock<TransportInner>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the change-set the next `fetch_changes` returns.
    pub fn seed_changes(&self, changes: ChangeSet) {
        self.inner.write().unwrap().remote_changes = changes;
    }

    /// Change-sets pushed so far, in push order.
    pub fn pushed(&self) -> Vec<ChangeSet> {
        self.inner.read().unwrap().pushed.clone()
    }

    /// Make the next transport call fail with a network error.
    pub fn fail_next(&self) {
        self.inner.write().unwrap().fail_next = true;
    }

    fn check_failure(&self, op: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.fail_next {
            inner.fail_next = false;
            return Err(Error::Network(format!("Injected failure during {op}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        self.check_failure("initialize")
    }

    async fn fetch_changes(&self, _since_ms: i64) -> Result<ChangeSet> {
        self.check_failure("fetch_changes")?;
        Ok(std::mem::take(
            &mut self.inner.write().unwrap().remote_changes,
        ))
    }

    async fn push_changes(&self, changes: ChangeSet) -> Result<()> {
        self.check_failure("push_changes")?;
        self.inner.write().unwrap().pushed.push(changes);
        Ok(())
    }

    async fn upload_backup(&self, payload: Vec<u8>) -> Result<()> {
        self.check_failure("upload_backup")?;
        self.inner.write().unwrap().backup = Some(payload);
        Ok(())
    }

    async fn download_backup(&self) -> Result<Vec<u8>> {
        self.check_failure("download_backup")?;
        self.inner
            .read()
            .unwrap()
            .backup
            .clone()
            .ok_or_else(|| Error::NotFound("No backup available".to_string()))
    }
}

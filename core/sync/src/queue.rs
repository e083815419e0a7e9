//! Connectivity-gated operation queue.
//!
//! Buffers sync-dependent actions until the link is sync-eligible, then
//! drains them in FIFO order under a single-flight guard. Retry counts are
//! tracked by the queue keyed by operation id; the operation descriptor
//! itself is immutable.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use satchel_common::Result;

use crate::connectivity::ConnectivityMonitor;
use crate::events::EventBus;

/// Default retry budget for a queued operation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

type OperationAction = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Immutable descriptor of a buffered network-dependent action.
#[derive(Clone)]
pub struct NetworkOperation {
    pub id: String,
    pub description: String,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    action: OperationAction,
}

impl NetworkOperation {
    /// Create an operation with the default retry budget.
    pub fn new<F>(description: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            action: Arc::new(action),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl std::fmt::Debug for NetworkOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkOperation")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("max_retries", &self.max_retries)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Queue notifications.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Operation exhausted its retry budget and was discarded.
    OperationFailed {
        id: String,
        description: String,
        attempts: u32,
    },
}

#[derive(Default)]
struct QueueInner {
    buffer: VecDeque<NetworkOperation>,
    /// Retry attempts so far, keyed by operation id.
    retries: HashMap<String, u32>,
}

/// Releases the single-flight flag on every exit path, including panics
/// inside an operation's action.
struct DrainFlag<'a>(&'a AtomicBool);

impl Drop for DrainFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// FIFO buffer of [`NetworkOperation`]s gated on sync eligibility.
pub struct OperationQueue {
    monitor: Arc<ConnectivityMonitor>,
    inner: Mutex<QueueInner>,
    draining: AtomicBool,
    bus: EventBus<QueueEvent>,
}

impl OperationQueue {
    pub fn new(monitor: Arc<ConnectivityMonitor>) -> Self {
        Self {
            monitor,
            inner: Mutex::new(QueueInner::default()),
            draining: AtomicBool::new(false),
            bus: EventBus::new(),
        }
    }

    /// Append an operation; if the link is sync-eligible and no drain is
    /// running, one drain attempt is triggered.
    pub async fn enqueue(&self, op: NetworkOperation) {
        debug!(id = %op.id, description = %op.description, "Enqueued operation");
        self.inner.lock().unwrap().buffer.push_back(op);
        if self.monitor.sync_eligible() {
            self.drain().await;
        }
    }

    /// Remove a not-yet-executing operation by id.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.buffer.len();
        inner.buffer.retain(|op| op.id != id);
        inner.retries.remove(id);
        inner.buffer.len() != before
    }

    /// Drop all buffered operations.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.buffer.clear();
        inner.retries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffered operation ids, in execution order.
    pub fn pending_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .buffer
            .iter()
            .map(|op| op.id.clone())
            .collect()
    }

    /// Subscribe to queue notifications.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        self.bus.subscribe()
    }

    /// Execute one pass over the currently buffered operations.
    ///
    /// Single-flight: a second trigger while a drain runs is a no-op.
    /// Eligibility is re-checked before each operation; when it lapses
    /// mid-pass the unprocessed tail is re-appended unchanged and the pass
    /// stops. Failed operations with retries remaining go to the end of
    /// the live buffer.
    pub async fn drain(&self) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let _flag = DrainFlag(&self.draining);

        let mut snapshot: VecDeque<NetworkOperation> = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.buffer)
        };
        if snapshot.is_empty() {
            return;
        }
        debug!(count = snapshot.len(), "Draining operation queue");

        while let Some(op) = snapshot.pop_front() {
            // Eligibility may have changed mid-drain.
            if !self.monitor.sync_eligible() {
                let mut inner = self.inner.lock().unwrap();
                inner.buffer.push_back(op);
                inner.buffer.extend(snapshot.drain(..));
                debug!("Eligibility lapsed mid-drain, pass stopped");
                return;
            }

            match (op.action)().await {
                Ok(()) => {
                    self.inner.lock().unwrap().retries.remove(&op.id);
                }
                Err(err) => {
                    let attempts = {
                        let inner = self.inner.lock().unwrap();
                        inner.retries.get(&op.id).copied().unwrap_or(0)
                    };
                    if attempts < op.max_retries {
                        warn!(
                            id = %op.id,
                            attempt = attempts + 1,
                            "Operation failed, will retry: {err}"
                        );
                        let mut inner = self.inner.lock().unwrap();
                        inner.retries.insert(op.id.clone(), attempts + 1);
                        inner.buffer.push_back(op);
                    } else {
                        warn!(
                            id = %op.id,
                            attempts = attempts + 1,
                            "Operation permanently failed: {err}"
                        );
                        self.inner.lock().unwrap().retries.remove(&op.id);
                        self.bus.publish(QueueEvent::OperationFailed {
                            id: op.id.clone(),
                            description: op.description.clone(),
                            attempts: attempts + 1,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::LinkType;
    use satchel_common::Error;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn eligible_monitor() -> Arc<ConnectivityMonitor> {
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        monitor.set_link(LinkType::Wifi);
        monitor
    }

    fn counting_op(
        description: &str,
        counter: Arc<AtomicU32>,
        fail_first: u32,
    ) -> NetworkOperation {
        NetworkOperation::new(description, move || {
            let counter = counter.clone();
            Box::pin(async move {
                let run = counter.fetch_add(1, AtomicOrdering::SeqCst);
                if run < fail_first {
                    Err(Error::Network("transient".to_string()))
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test]
    async fn operations_wait_for_eligibility() {
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let queue = OperationQueue::new(monitor.clone());
        let ran = Arc::new(AtomicU32::new(0));

        queue.enqueue(counting_op("op", ran.clone(), 0)).await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(queue.len(), 1);

        monitor.set_link(LinkType::Wifi);
        queue.drain().await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn enqueue_while_eligible_executes_immediately() {
        let queue = OperationQueue::new(eligible_monitor());
        let ran = Arc::new(AtomicU32::new(0));

        queue.enqueue(counting_op("op", ran.clone(), 0)).await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn fifo_order_with_one_transient_failure() {
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let queue = OperationQueue::new(monitor.clone());

        let order = Arc::new(Mutex::new(Vec::new()));
        let b_runs = Arc::new(AtomicU32::new(0));

        let make = |name: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            NetworkOperation::new(name, move || {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                })
            })
        };

        queue.enqueue(make("A", order.clone())).await;
        let order_b = order.clone();
        let b_runs_clone = b_runs.clone();
        queue
            .enqueue(NetworkOperation::new("B", move || {
                let order = order_b.clone();
                let runs = b_runs_clone.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("B");
                    if runs.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                        Err(Error::Network("flaky".to_string()))
                    } else {
                        Ok(())
                    }
                })
            }))
            .await;
        queue.enqueue(make("C", order.clone())).await;

        monitor.set_link(LinkType::Wifi);
        queue.drain().await;
        // First pass: A, B (fails, re-appended), C. B is now the buffer.
        assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(queue.len(), 1);

        queue.drain().await;
        assert!(queue.is_empty());
        assert_eq!(b_runs.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_discards_and_reports() {
        let queue = OperationQueue::new(eligible_monitor());
        let mut events = queue.subscribe();
        let runs = Arc::new(AtomicU32::new(0));

        let op = counting_op("doomed", runs.clone(), u32::MAX).with_max_retries(2);
        queue.enqueue(op).await;
        // Initial attempt plus retries on subsequent drains.
        queue.drain().await;
        queue.drain().await;

        assert!(queue.is_empty());
        // Initial + 2 retries = 3 attempts, then discarded.
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 3);
        match events.try_recv().unwrap() {
            QueueEvent::OperationFailed { attempts, .. } => assert_eq!(attempts, 3),
        }

        // Never attempted again.
        queue.drain().await;
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn eligibility_lapse_preserves_unprocessed_tail() {
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        monitor.set_link(LinkType::Wifi);
        let queue = Arc::new(OperationQueue::new(monitor.clone()));

        let ran = Arc::new(AtomicU32::new(0));
        let monitor_clone = monitor.clone();
        let ran_clone = ran.clone();

        // First operation drops the link mid-drain.
        let first = NetworkOperation::new("disconnector", move || {
            let monitor = monitor_clone.clone();
            let ran = ran_clone.clone();
            Box::pin(async move {
                ran.fetch_add(1, AtomicOrdering::SeqCst);
                monitor.set_link(LinkType::None);
                Ok(())
            })
        });
        let second = counting_op("tail-1", ran.clone(), 0);
        let third = counting_op("tail-2", ran.clone(), 0);
        let tail_ids = vec![second.id.clone(), third.id.clone()];

        {
            let mut inner = queue.inner.lock().unwrap();
            inner.buffer.push_back(first);
            inner.buffer.push_back(second);
            inner.buffer.push_back(third);
        }

        queue.drain().await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
        // Tail preserved in original order.
        assert_eq!(queue.pending_ids(), tail_ids);
    }

    #[tokio::test]
    async fn concurrent_triggers_never_overlap_drains() {
        let queue = Arc::new(OperationQueue::new(eligible_monitor()));

        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        for i in 0..4 {
            let active = active.clone();
            let peak = peak.clone();
            let op = NetworkOperation::new(format!("op-{i}"), move || {
                let active = active.clone();
                let peak = peak.clone();
                Box::pin(async move {
                    let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    peak.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    active.fetch_sub(1, AtomicOrdering::SeqCst);
                    Ok(())
                })
            });
            queue.inner.lock().unwrap().buffer.push_back(op);
        }

        let mut handles = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { queue.drain().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // Late triggers may leave work buffered; finish it.
        queue.drain().await;

        assert!(queue.is_empty());
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let queue = OperationQueue::new(monitor);
        let ran = Arc::new(AtomicU32::new(0));

        let op = counting_op("removable", ran.clone(), 0);
        let id = op.id.clone();
        queue.enqueue(op).await;
        queue.enqueue(counting_op("other", ran.clone(), 0)).await;

        assert!(queue.remove(&id));
        assert!(!queue.remove(&id));
        assert_eq!(queue.len(), 1);

        queue.clear();
        assert!(queue.is_empty());
    }
}

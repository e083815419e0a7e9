//! Composition root wiring the sync collaborators together.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use satchel_common::Result;
use satchel_store::{CloudTransport, RecordStore};

use crate::connectivity::ConnectivityMonitor;
use crate::engine::{SyncConfig, SyncEngine, SyncReport};
use crate::queue::{NetworkOperation, OperationQueue, DEFAULT_MAX_RETRIES};
use crate::scheduler::{BackgroundScheduler, BatteryProbe, HostScheduler};

/// Probe pinned by configuration, overriding the platform one.
struct FixedBatteryProbe(bool);

impl BatteryProbe for FixedBatteryProbe {
    fn battery_optimized(&self) -> bool {
        self.0
    }
}

/// Owns the monitor, queue, scheduler and engine for one device process.
///
/// Connectivity wiring: every edge-triggered connectivity event re-checks
/// eligibility; when eligible, the queue is drained and a connectivity
/// sync is scheduled. Lapses need no handling here since the queue and
/// scheduler gate themselves.
pub struct SyncService<S, T> {
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<OperationQueue>,
    scheduler: Arc<BackgroundScheduler>,
    engine: Arc<SyncEngine<S, T>>,
    wiring: Mutex<Option<JoinHandle<()>>>,
}

impl<S: RecordStore + 'static, T: CloudTransport + 'static> SyncService<S, T> {
    /// Wire up and start the service.
    ///
    /// Transport initialization is best-effort; the periodic sync task is
    /// registered with the host before returning.
    pub async fn start(
        store: Arc<S>,
        transport: Arc<T>,
        host: Arc<dyn HostScheduler>,
        probe: Box<dyn BatteryProbe>,
        config: SyncConfig,
    ) -> Result<Self> {
        let monitor = Arc::new(ConnectivityMonitor::new(config.wifi_preferred));
        let queue = Arc::new(OperationQueue::new(Arc::clone(&monitor)));

        let probe: Box<dyn BatteryProbe> = match config.battery_optimized_override {
            Some(forced) => Box::new(FixedBatteryProbe(forced)),
            None => probe,
        };

        let engine = Arc::new(SyncEngine::new(store, transport, config));
        engine.initialize().await;

        let scheduler = Arc::new(BackgroundScheduler::new(
            host,
            Arc::clone(&engine) as Arc<dyn crate::scheduler::SyncInvoker>,
            probe,
        ));
        scheduler.schedule_periodic_sync().await?;

        let wiring = spawn_connectivity_wiring(
            Arc::clone(&monitor),
            Arc::clone(&queue),
            Arc::clone(&scheduler),
        );

        info!("Sync service started");
        Ok(Self {
            monitor,
            queue,
            scheduler,
            engine,
            wiring: Mutex::new(Some(wiring)),
        })
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<BackgroundScheduler> {
        &self.scheduler
    }

    pub fn engine(&self) -> &Arc<SyncEngine<S, T>> {
        &self.engine
    }

    /// Manual sync affordance.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        self.engine.sync().await
    }

    /// Queue a network-dependent operation. Operations still carrying the
    /// default retry budget adopt the configured one; an explicit
    /// `with_max_retries` is kept. Runs inline when already eligible.
    pub async fn enqueue(&self, op: NetworkOperation) {
        let op = if op.max_retries == DEFAULT_MAX_RETRIES {
            op.with_max_retries(self.engine.config().max_retries)
        } else {
            op
        };
        self.queue.enqueue(op).await;
    }

    /// Stop reacting to connectivity, drop queued work and cancel
    /// registered background tasks.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.wiring.lock().unwrap().take() {
            handle.abort();
        }
        self.queue.clear();
        self.scheduler.cancel_all().await;
        info!("Sync service shut down");
    }
}

fn spawn_connectivity_wiring(
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<OperationQueue>,
    scheduler: Arc<BackgroundScheduler>,
) -> JoinHandle<()> {
    let mut events = monitor.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(?event, "Connectivity event");
            if !monitor.sync_eligible() {
                continue;
            }
            queue.drain().await;
            if let Err(err) = scheduler.schedule_connectivity_sync().await {
                warn!("Could not schedule connectivity sync: {err}");
            }
        }
    })
}

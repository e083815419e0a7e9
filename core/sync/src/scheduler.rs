//! Background scheduling policy and host task dispatch.
//!
//! The scheduler owns exactly three logical task identities and translates
//! the power policy into intervals and execution constraints. The host OS
//! scheduler is behind the [`HostScheduler`] trait; on fire it calls back
//! into [`BackgroundScheduler::dispatch`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use satchel_common::Result;

/// Periodic sync task identity.
pub const TASK_PERIODIC_SYNC: &str = "sync.periodic";
/// One-off immediate (user-requested) sync task identity.
pub const TASK_IMMEDIATE_SYNC: &str = "sync.immediate";
/// One-off connectivity-triggered sync task identity.
pub const TASK_CONNECTIVITY_SYNC: &str = "sync.connectivity";

/// Periodic interval under the normal power policy.
const PERIODIC_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Periodic interval under the battery-optimized policy.
const PERIODIC_INTERVAL_OPTIMIZED: Duration = Duration::from_secs(2 * 60 * 60);
/// Debounce delay for explicit sync requests.
const IMMEDIATE_DELAY: Duration = Duration::from_secs(5);
/// Link-stabilization delay after a reconnect.
const CONNECTIVITY_DELAY: Duration = Duration::from_secs(10);
/// Base delay for the host's exponential backoff on task failure.
const BACKOFF_BASE_DELAY: Duration = Duration::from_secs(5 * 60);

/// Execution constraints handed to the host scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConstraints {
    pub network_required: bool,
    pub requires_battery_not_low: bool,
    pub requires_charging: bool,
}

/// When a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSchedule {
    Periodic { interval: Duration },
    OneOff { delay: Duration },
}

/// Backoff the host applies when a dispatched task reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub exponential: bool,
    pub base_delay: Duration,
}

/// A registration request for the host scheduler.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: &'static str,
    pub schedule: TaskSchedule,
    pub constraints: TaskConstraints,
    pub backoff: BackoffPolicy,
}

/// Host background-task API.
///
/// The host invokes [`BackgroundScheduler::dispatch`] with the task id and
/// optional payload when a registered task fires, and owns any OS-level
/// retry/backoff beyond the reported success boolean.
#[async_trait]
pub trait HostScheduler: Send + Sync {
    async fn register(&self, spec: TaskSpec) -> Result<()>;
    async fn cancel(&self, task_id: &str) -> Result<()>;
    async fn cancel_all(&self) -> Result<()>;
}

/// Platform capability query for the power policy.
pub trait BatteryProbe: Send + Sync {
    fn battery_optimized(&self) -> bool;
}

/// Probe for hosts without a battery-optimization capability.
pub struct DefaultBatteryProbe;

impl BatteryProbe for DefaultBatteryProbe {
    fn battery_optimized(&self) -> bool {
        false
    }
}

/// Entry point the scheduler drives on task fire.
#[async_trait]
pub trait SyncInvoker: Send + Sync {
    async fn run_sync(&self) -> Result<()>;
}

/// Registers sync tasks with the host scheduler and dispatches their fires.
///
/// Lifecycle: `uninitialized → initialized`, one-way. All registration
/// calls implicitly initialize first.
pub struct BackgroundScheduler {
    host: Arc<dyn HostScheduler>,
    invoker: Arc<dyn SyncInvoker>,
    probe: Box<dyn BatteryProbe>,
    initialized: AtomicBool,
    battery_optimized: AtomicBool,
}

impl BackgroundScheduler {
    pub fn new(
        host: Arc<dyn HostScheduler>,
        invoker: Arc<dyn SyncInvoker>,
        probe: Box<dyn BatteryProbe>,
    ) -> Self {
        Self {
            host,
            invoker,
            probe,
            initialized: AtomicBool::new(false),
            battery_optimized: AtomicBool::new(false),
        }
    }

    /// Determine the power policy once. Idempotent; later calls no-op.
    pub fn initialize(&self) {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // Probe failures inside an implementation are its own concern; the
        // trait is infallible and defaults decide the policy here.
        let optimized = self.probe.battery_optimized();
        self.battery_optimized.store(optimized, Ordering::Release);
        info!(battery_optimized = optimized, "Background scheduler initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn battery_optimized(&self) -> bool {
        self.battery_optimized.load(Ordering::Acquire)
    }

    /// Battery rule shared by the periodic and connectivity tasks: demand
    /// charging under the optimized policy, battery-not-low otherwise.
    fn battery_rule(&self) -> TaskConstraints {
        let optimized = self.battery_optimized();
        TaskConstraints {
            network_required: true,
            requires_battery_not_low: !optimized,
            requires_charging: optimized,
        }
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            exponential: true,
            base_delay: BACKOFF_BASE_DELAY,
        }
    }

    /// Register the periodic sync task.
    pub async fn schedule_periodic_sync(&self) -> Result<()> {
        self.initialize();
        let interval = if self.battery_optimized() {
            PERIODIC_INTERVAL_OPTIMIZED
        } else {
            PERIODIC_INTERVAL
        };
        self.host
            .register(TaskSpec {
                id: TASK_PERIODIC_SYNC,
                schedule: TaskSchedule::Periodic { interval },
                constraints: self.battery_rule(),
                backoff: self.backoff(),
            })
            .await
    }

    /// Register a one-off sync for an explicit user/app request, debounced
    /// by a short delay.
    pub async fn request_immediate_sync(&self) -> Result<()> {
        self.initialize();
        self.host
            .register(TaskSpec {
                id: TASK_IMMEDIATE_SYNC,
                schedule: TaskSchedule::OneOff {
                    delay: IMMEDIATE_DELAY,
                },
                constraints: TaskConstraints {
                    network_required: true,
                    requires_battery_not_low: true,
                    requires_charging: false,
                },
                backoff: self.backoff(),
            })
            .await
    }

    /// Register a one-off sync after a disconnected → connected transition,
    /// delayed to let the link stabilize.
    pub async fn schedule_connectivity_sync(&self) -> Result<()> {
        self.initialize();
        self.host
            .register(TaskSpec {
                id: TASK_CONNECTIVITY_SYNC,
                schedule: TaskSchedule::OneOff {
                    delay: CONNECTIVITY_DELAY,
                },
                constraints: self.battery_rule(),
                backoff: self.backoff(),
            })
            .await
    }

    /// Host callback on task fire.
    ///
    /// Pure dispatch over the fixed task table: runs the handler and
    /// reports success to the host; never throws. Unknown identities log
    /// and report failure.
    pub async fn dispatch(&self, task_id: &str, _payload: Option<serde_json::Value>) -> bool {
        match task_id {
            TASK_PERIODIC_SYNC | TASK_IMMEDIATE_SYNC | TASK_CONNECTIVITY_SYNC => {
                match self.invoker.run_sync().await {
                    Ok(()) => true,
                    Err(err) => {
                        error!(task_id, "Background sync failed: {err}");
                        false
                    }
                }
            }
            unknown => {
                warn!(task_id = unknown, "Unknown background task identity");
                false
            }
        }
    }

    /// Best-effort cancellation of one task; failure must not block
    /// shutdown.
    pub async fn cancel_task(&self, task_id: &str) {
        if let Err(err) = self.host.cancel(task_id).await {
            warn!(task_id, "Task cancellation failed: {err}");
        }
    }

    /// Best-effort cancellation of all tasks.
    pub async fn cancel_all(&self) {
        if let Err(err) = self.host.cancel_all().await {
            warn!("Bulk task cancellation failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_common::Error;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHost {
        registered: Mutex<Vec<TaskSpec>>,
        fail_register: AtomicBool,
        fail_cancel: AtomicBool,
    }

    #[async_trait]
    impl HostScheduler for RecordingHost {
        async fn register(&self, spec: TaskSpec) -> Result<()> {
            if self.fail_register.load(Ordering::SeqCst) {
                return Err(Error::Scheduler("registration rejected".to_string()));
            }
            self.registered.lock().unwrap().push(spec);
            Ok(())
        }

        async fn cancel(&self, _task_id: &str) -> Result<()> {
            if self.fail_cancel.load(Ordering::SeqCst) {
                return Err(Error::Scheduler("cancel rejected".to_string()));
            }
            Ok(())
        }

        async fn cancel_all(&self) -> Result<()> {
            if self.fail_cancel.load(Ordering::SeqCst) {
                return Err(Error::Scheduler("cancel rejected".to_string()));
            }
            Ok(())
        }
    }

    struct CountingInvoker {
        runs: AtomicU32,
        fail: AtomicBool,
    }

    impl CountingInvoker {
        fn new() -> Self {
            Self {
                runs: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl SyncInvoker for CountingInvoker {
        async fn run_sync(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Network("offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct OptimizedProbe;

    impl BatteryProbe for OptimizedProbe {
        fn battery_optimized(&self) -> bool {
            true
        }
    }

    fn scheduler_with(
        host: Arc<RecordingHost>,
        invoker: Arc<CountingInvoker>,
        probe: Box<dyn BatteryProbe>,
    ) -> BackgroundScheduler {
        BackgroundScheduler::new(host, invoker, probe)
    }

    #[tokio::test]
    async fn periodic_registration_under_normal_policy() {
        let host = Arc::new(RecordingHost::default());
        let scheduler = scheduler_with(
            host.clone(),
            Arc::new(CountingInvoker::new()),
            Box::new(DefaultBatteryProbe),
        );

        scheduler.schedule_periodic_sync().await.unwrap();

        let specs = host.registered.lock().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, TASK_PERIODIC_SYNC);
        assert_eq!(
            specs[0].schedule,
            TaskSchedule::Periodic {
                interval: Duration::from_secs(30 * 60)
            }
        );
        assert!(specs[0].constraints.network_required);
        assert!(specs[0].constraints.requires_battery_not_low);
        assert!(!specs[0].constraints.requires_charging);
        assert!(specs[0].backoff.exponential);
        assert_eq!(specs[0].backoff.base_delay, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn periodic_registration_under_optimized_policy() {
        let host = Arc::new(RecordingHost::default());
        let scheduler = scheduler_with(
            host.clone(),
            Arc::new(CountingInvoker::new()),
            Box::new(OptimizedProbe),
        );

        scheduler.schedule_periodic_sync().await.unwrap();

        let specs = host.registered.lock().unwrap();
        assert_eq!(
            specs[0].schedule,
            TaskSchedule::Periodic {
                interval: Duration::from_secs(2 * 60 * 60)
            }
        );
        assert!(!specs[0].constraints.requires_battery_not_low);
        assert!(specs[0].constraints.requires_charging);
    }

    #[tokio::test]
    async fn one_off_delays_and_constraints() {
        let host = Arc::new(RecordingHost::default());
        let scheduler = scheduler_with(
            host.clone(),
            Arc::new(CountingInvoker::new()),
            Box::new(DefaultBatteryProbe),
        );

        scheduler.request_immediate_sync().await.unwrap();
        scheduler.schedule_connectivity_sync().await.unwrap();

        let specs = host.registered.lock().unwrap();
        assert_eq!(specs[0].id, TASK_IMMEDIATE_SYNC);
        assert_eq!(
            specs[0].schedule,
            TaskSchedule::OneOff {
                delay: Duration::from_secs(5)
            }
        );
        assert!(specs[0].constraints.requires_battery_not_low);

        assert_eq!(specs[1].id, TASK_CONNECTIVITY_SYNC);
        assert_eq!(
            specs[1].schedule,
            TaskSchedule::OneOff {
                delay: Duration::from_secs(10)
            }
        );
    }

    #[tokio::test]
    async fn initialize_is_idempotent_and_implicit() {
        let host = Arc::new(RecordingHost::default());
        let scheduler = scheduler_with(
            host.clone(),
            Arc::new(CountingInvoker::new()),
            Box::new(OptimizedProbe),
        );
        assert!(!scheduler.is_initialized());

        // Registration initializes implicitly.
        scheduler.request_immediate_sync().await.unwrap();
        assert!(scheduler.is_initialized());

        scheduler.initialize();
        scheduler.initialize();
        assert!(scheduler.battery_optimized());
    }

    #[tokio::test]
    async fn dispatch_runs_known_tasks_and_reports_failure() {
        let invoker = Arc::new(CountingInvoker::new());
        let scheduler = scheduler_with(
            Arc::new(RecordingHost::default()),
            invoker.clone(),
            Box::new(DefaultBatteryProbe),
        );

        assert!(scheduler.dispatch(TASK_PERIODIC_SYNC, None).await);
        assert!(scheduler.dispatch(TASK_IMMEDIATE_SYNC, None).await);
        assert_eq!(invoker.runs.load(Ordering::SeqCst), 2);

        invoker.fail.store(true, Ordering::SeqCst);
        assert!(!scheduler.dispatch(TASK_CONNECTIVITY_SYNC, None).await);
    }

    #[tokio::test]
    async fn unknown_task_identity_reports_failure_without_running() {
        let invoker = Arc::new(CountingInvoker::new());
        let scheduler = scheduler_with(
            Arc::new(RecordingHost::default()),
            invoker.clone(),
            Box::new(DefaultBatteryProbe),
        );

        assert!(!scheduler.dispatch("sync.unheard-of", None).await);
        assert_eq!(invoker.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn registration_failure_is_surfaced_but_cancel_is_best_effort() {
        let host = Arc::new(RecordingHost::default());
        host.fail_register.store(true, Ordering::SeqCst);
        host.fail_cancel.store(true, Ordering::SeqCst);

        let scheduler = scheduler_with(
            host,
            Arc::new(CountingInvoker::new()),
            Box::new(DefaultBatteryProbe),
        );

        assert!(scheduler.schedule_periodic_sync().await.is_err());
        // Cancellation failures are swallowed: shutdown must not block.
        scheduler.cancel_task(TASK_PERIODIC_SYNC).await;
        scheduler.cancel_all().await;
    }
}

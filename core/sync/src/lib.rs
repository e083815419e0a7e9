//! Satchel Sync Core
//!
//! This crate provides offline-first synchronization for Satchel, including:
//! - Connectivity monitoring with edge-triggered events
//! - An offline operation queue with bounded retries
//! - Background scheduling with battery-aware cadences
//! - A sync lifecycle state machine
//! - Conflict detection reporting and resolution
//! - Backup and restore passes over the cloud transport

pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod events;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod state;

// Re-export main types
pub use conflict::ConflictResolver;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, LinkType};
pub use engine::{SyncConfig, SyncEngine, SyncReport};
pub use events::EventBus;
pub use queue::{NetworkOperation, OperationQueue, QueueEvent};
pub use scheduler::{
    BackgroundScheduler, BatteryProbe, DefaultBatteryProbe, HostScheduler, SyncInvoker, TaskSpec,
};
pub use service::SyncService;
pub use state::{Activity, SyncState, SyncStateMachine, SyncStatus};

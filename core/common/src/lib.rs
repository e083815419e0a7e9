//! Common utilities and types shared across Satchel modules.
//!
//! This module provides foundational types that are used throughout the
//! codebase, ensuring consistency and type safety.

pub mod conflict;
pub mod error;
pub mod record;

pub use conflict::{ConflictResolution, ConflictType, ResolutionStrategy, SyncConflict};
pub use error::{Error, Result};
pub use record::{RecordStatus, SyncJson, Syncable};

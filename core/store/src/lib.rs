//! Storage collaborators for the Satchel sync core.
//!
//! The on-device record store and the cloud transport are external
//! collaborators; this crate defines their boundaries and ships in-memory
//! implementations for tests and development.

pub mod memory;
pub mod store;
pub mod transport;

pub use memory::MemoryStore;
pub use store::{ChangeSet, RecordStore, RecordWrite};
pub use transport::{CloudTransport, MemoryTransport};

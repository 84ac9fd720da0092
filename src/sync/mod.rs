//! KV synchronization with a remote inference process.
//!
//! - [`store`]: Cache-storage service trait and in-memory implementation
//! - [`driver`]: Two-phase retrieve/store state machine

pub mod driver;
pub mod store;

pub use driver::{DriverStats, PhaseReport, SyncDriver, SyncError, SyncPhase};
pub use store::{InMemoryKvStore, KvLayout, KvStore};

//! Consistency watchdog primitives
//!
//! A consistency record is a durable intent-to-write for one object. It
//! is inserted before the write is dispatched to the replicas, deleted on
//! full success, and otherwise consumed later by the reconciler. This
//! crate defines the record model, the log contract and the redb-backed
//! log implementation.

pub mod log;
pub mod record;
pub mod redb_log;

pub use log::{ConsistencyLog, LogError, WalEntry};
pub use record::{ConsistencyRecord, DeleteMarker, ExecutionDelay};
pub use redb_log::RedbConsistencyLog;

/// In-memory log used by tests across the workspace
pub mod testing;

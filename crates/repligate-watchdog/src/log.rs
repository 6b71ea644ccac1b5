//! Consistency log contract

use crate::record::{ConsistencyRecord, DeleteMarker, ExecutionDelay};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Consistency log errors
#[derive(Debug, Clone, Error)]
pub enum LogError {
    #[error("consistency log storage error: {0}")]
    Storage(String),

    #[error("consistency record failed to serialize: {0}")]
    Serialization(String),
}

/// A live log entry as seen by the reconciler
#[derive(Clone, Debug)]
pub struct WalEntry {
    pub record: ConsistencyRecord,
    pub marker: DeleteMarker,
}

/// Durable append/delete/update store for consistency records.
///
/// `insert` must not return before the record is durable; inserted
/// records must become visible to `due_records` within bounded staleness.
#[async_trait]
pub trait ConsistencyLog: Send + Sync {
    /// Atomically persist a record; the marker identifies it for deletion
    async fn insert(&self, record: &ConsistencyRecord) -> Result<DeleteMarker, LogError>;

    /// Remove a record; deleting an already-deleted marker is a no-op
    async fn delete(&self, marker: &DeleteMarker) -> Result<(), LogError>;

    /// Shift `execution_date` of the live records matching
    /// (object_id, domain) by the signed delta
    async fn update_execution_delay(&self, delay: &ExecutionDelay) -> Result<(), LogError>;

    /// Assign the next monotonic object version to the record
    async fn supply_record_with_version(
        &self,
        record: &mut ConsistencyRecord,
    ) -> Result<(), LogError>;

    /// Live records with `execution_date <= now`, ordered by
    /// (object_id, object_version), at most `limit`
    async fn due_records(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WalEntry>, LogError>;
}

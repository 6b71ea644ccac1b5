//! In-memory consistency log for tests
//!
//! Mirrors the redb log's semantics (keyed by object id + version,
//! monotonic counter) without touching disk, and can be told to fail
//! inserts to exercise the strong/weak consistency paths.

use crate::log::{ConsistencyLog, LogError, WalEntry};
use crate::record::{ConsistencyRecord, DeleteMarker, ExecutionDelay};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

/// In-memory log with failure injection
#[derive(Default)]
pub struct MemoryConsistencyLog {
    records: Mutex<BTreeMap<(String, i64), ConsistencyRecord>>,
    counter: AtomicI64,
    fail_inserts: AtomicBool,
    insert_count: AtomicUsize,
    delete_count: AtomicUsize,
}

impl MemoryConsistencyLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the live records
    pub fn records(&self) -> Vec<ConsistencyRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub fn insert_count(&self) -> usize {
        self.insert_count.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.delete_count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ConsistencyLog for MemoryConsistencyLog {
    async fn insert(&self, record: &ConsistencyRecord) -> Result<DeleteMarker, LogError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(LogError::Storage("log is down".into()));
        }
        self.insert_count.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .insert((record.object_id.clone(), record.object_version), record.clone());
        Ok(DeleteMarker {
            object_id: record.object_id.clone(),
            object_version: record.object_version,
        })
    }

    async fn delete(&self, marker: &DeleteMarker) -> Result<(), LogError> {
        self.delete_count.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .remove(&(marker.object_id.clone(), marker.object_version));
        Ok(())
    }

    async fn update_execution_delay(&self, delay: &ExecutionDelay) -> Result<(), LogError> {
        let mut records = self.records.lock();
        for ((object_id, _), record) in records.iter_mut() {
            if object_id == &delay.object_id && record.domain == delay.domain {
                record.execution_date += delay.delta;
            }
        }
        Ok(())
    }

    async fn supply_record_with_version(
        &self,
        record: &mut ConsistencyRecord,
    ) -> Result<(), LogError> {
        record.object_version = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(())
    }

    async fn due_records(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WalEntry>, LogError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|(_, record)| record.execution_date <= now)
            .take(limit)
            .map(|((object_id, version), record)| WalEntry {
                record: record.clone(),
                marker: DeleteMarker { object_id: object_id.clone(), object_version: *version },
            })
            .collect())
    }
}

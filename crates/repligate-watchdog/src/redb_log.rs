//! Redb-backed consistency log
//!
//! Records live in a single `records` table keyed by
//! `"{object_id}\x00{version:020}"`, which keeps the natural scan order
//! (object, then version) and makes per-object prefix scans cheap. A
//! `counters` table holds the monotonic version counter. Every mutation
//! is one committed write transaction, so `insert` returning implies the
//! record is on disk.

use crate::log::{ConsistencyLog, LogError, WalEntry};
use crate::record::{ConsistencyRecord, DeleteMarker, ExecutionDelay};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("consistency_records");
const COUNTERS: TableDefinition<&str, i64> = TableDefinition::new("counters");

const VERSION_COUNTER: &str = "object_version";

/// Durable consistency log on redb
pub struct RedbConsistencyLog {
    db: Database,
}

impl RedbConsistencyLog {
    /// Open (or create) the log database
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let db = Database::create(path).map_err(|e| LogError::Storage(e.to_string()))?;
        // Ensure both tables exist so later read transactions never fail
        let txn = db.begin_write().map_err(|e| LogError::Storage(e.to_string()))?;
        {
            txn.open_table(RECORDS)
                .map_err(|e| LogError::Storage(e.to_string()))?;
            txn.open_table(COUNTERS)
                .map_err(|e| LogError::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| LogError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    fn record_key(object_id: &str, version: i64) -> String {
        format!("{object_id}\u{0}{version:020}")
    }

    fn object_prefix_range(object_id: &str) -> (String, String) {
        (format!("{object_id}\u{0}"), format!("{object_id}\u{1}"))
    }

    fn encode(record: &ConsistencyRecord) -> Result<Vec<u8>, LogError> {
        serde_json::to_vec(record).map_err(|e| LogError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<ConsistencyRecord, LogError> {
        serde_json::from_slice(bytes).map_err(|e| LogError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl ConsistencyLog for RedbConsistencyLog {
    async fn insert(&self, record: &ConsistencyRecord) -> Result<DeleteMarker, LogError> {
        let key = Self::record_key(&record.object_id, record.object_version);
        let value = Self::encode(record)?;

        let txn = self
            .db
            .begin_write()
            .map_err(|e| LogError::Storage(e.to_string()))?;
        {
            let mut table = txn
                .open_table(RECORDS)
                .map_err(|e| LogError::Storage(e.to_string()))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(|e| LogError::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| LogError::Storage(e.to_string()))?;

        Ok(DeleteMarker {
            object_id: record.object_id.clone(),
            object_version: record.object_version,
        })
    }

    async fn delete(&self, marker: &DeleteMarker) -> Result<(), LogError> {
        let key = Self::record_key(&marker.object_id, marker.object_version);

        let txn = self
            .db
            .begin_write()
            .map_err(|e| LogError::Storage(e.to_string()))?;
        {
            let mut table = txn
                .open_table(RECORDS)
                .map_err(|e| LogError::Storage(e.to_string()))?;
            table
                .remove(key.as_str())
                .map_err(|e| LogError::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| LogError::Storage(e.to_string()))
    }

    async fn update_execution_delay(&self, delay: &ExecutionDelay) -> Result<(), LogError> {
        let (start, end) = Self::object_prefix_range(&delay.object_id);

        let txn = self
            .db
            .begin_write()
            .map_err(|e| LogError::Storage(e.to_string()))?;
        {
            let mut table = txn
                .open_table(RECORDS)
                .map_err(|e| LogError::Storage(e.to_string()))?;

            let mut shifted: Vec<(String, Vec<u8>)> = Vec::new();
            for item in table
                .range(start.as_str()..end.as_str())
                .map_err(|e| LogError::Storage(e.to_string()))?
            {
                let (key, value) = item.map_err(|e| LogError::Storage(e.to_string()))?;
                let mut record = Self::decode(value.value())?;
                if record.domain != delay.domain {
                    continue;
                }
                record.execution_date += delay.delta;
                shifted.push((key.value().to_string(), Self::encode(&record)?));
            }

            for (key, value) in shifted {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(|e| LogError::Storage(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| LogError::Storage(e.to_string()))
    }

    async fn supply_record_with_version(
        &self,
        record: &mut ConsistencyRecord,
    ) -> Result<(), LogError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| LogError::Storage(e.to_string()))?;
        let next = {
            let mut table = txn
                .open_table(COUNTERS)
                .map_err(|e| LogError::Storage(e.to_string()))?;
            let current = table
                .get(VERSION_COUNTER)
                .map_err(|e| LogError::Storage(e.to_string()))?
                .map(|v| v.value())
                .unwrap_or(0);
            let next = current + 1;
            table
                .insert(VERSION_COUNTER, next)
                .map_err(|e| LogError::Storage(e.to_string()))?;
            next
        };
        txn.commit().map_err(|e| LogError::Storage(e.to_string()))?;

        record.object_version = next;
        Ok(())
    }

    async fn due_records(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WalEntry>, LogError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| LogError::Storage(e.to_string()))?;
        let table = txn
            .open_table(RECORDS)
            .map_err(|e| LogError::Storage(e.to_string()))?;

        let mut entries = Vec::new();
        for item in table.iter().map_err(|e| LogError::Storage(e.to_string()))? {
            if entries.len() >= limit {
                break;
            }
            let (_, value) = item.map_err(|e| LogError::Storage(e.to_string()))?;
            let record = Self::decode(value.value())?;
            if record.execution_date > now {
                continue;
            }
            let marker = DeleteMarker {
                object_id: record.object_id.clone(),
                object_version: record.object_version,
            };
            entries.push(WalEntry { record, marker });
        }
        Ok(entries)
    }
}

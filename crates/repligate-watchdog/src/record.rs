//! Consistency record model

use chrono::{DateTime, Duration, Utc};
use repligate_common::Method;
use serde::{Deserialize, Serialize};

/// Durable intent-to-write for one object.
///
/// `object_version` is assigned by the log before insert and is strictly
/// increasing per object; `execution_date` is the earliest instant the
/// reconciler may act on the record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyRecord {
    /// `bucket/key`
    pub object_id: String,
    /// Region domain the request arrived on
    pub domain: String,
    pub method: Method,
    pub access_key: String,
    pub request_id: String,
    /// Monotonic write version; 0 until supplied by the log
    #[serde(default)]
    pub object_version: i64,
    pub execution_date: DateTime<Utc>,
}

impl ConsistencyRecord {
    /// Build a record for a write arriving now, due after `delay`
    pub fn new(
        object_id: impl Into<String>,
        domain: impl Into<String>,
        method: Method,
        access_key: impl Into<String>,
        request_id: impl Into<String>,
        delay: Duration,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            domain: domain.into(),
            method,
            access_key: access_key.into(),
            request_id: request_id.into(),
            object_version: 0,
            execution_date: Utc::now() + delay,
        }
    }

    /// A PUT-shaped copy carrying a fixed version, used for read-repair
    #[must_use]
    pub fn read_repair_copy(&self, version: i64) -> Self {
        let mut copy = self.clone();
        copy.method = Method::Put;
        copy.object_version = version;
        copy
    }
}

/// Opaque token identifying one inserted record; required to delete it
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeleteMarker {
    pub(crate) object_id: String,
    pub(crate) object_version: i64,
}

impl DeleteMarker {
    #[must_use]
    pub fn object_id(&self) -> &str {
        &self.object_id
    }
}

/// Parameters of an execution-date shift.
///
/// A single signed delta: positive pushes the deadline later, negative
/// pulls it earlier.
#[derive(Clone, Debug)]
pub struct ExecutionDelay {
    pub object_id: String,
    pub domain: String,
    pub delta: Duration,
}

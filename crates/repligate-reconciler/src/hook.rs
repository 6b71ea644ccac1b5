//! Record completion hook
//!
//! Removes the record from the consistency log once reconciliation of
//! the entry is finished, successfully or permanently-failed, and clears
//! the entry from the in-flight set so the scanner may pick the object
//! up again.

use parking_lot::Mutex;
use repligate_common::Error;
use repligate_watchdog::{ConsistencyLog, DeleteMarker};
use std::collections::HashSet;
use std::sync::Arc;

/// Fires exactly once per log entry, after all of its tasks completed
pub struct RecordHook {
    log: Arc<dyn ConsistencyLog>,
    marker: DeleteMarker,
    in_flight: Option<Arc<Mutex<HashSet<DeleteMarker>>>>,
}

impl RecordHook {
    pub fn new(
        log: Arc<dyn ConsistencyLog>,
        marker: DeleteMarker,
        in_flight: Option<Arc<Mutex<HashSet<DeleteMarker>>>>,
    ) -> Self {
        Self { log, marker, in_flight }
    }

    /// Consume the hook: log the outcome, remove the record when the
    /// entry is finished, release the in-flight slot.
    ///
    /// A malformed record is removed even on failure so it cannot poison
    /// the queue; a transiently failed entry stays and is retried on a
    /// later scan.
    pub async fn complete(self, result: Result<(), Error>) {
        let remove_record = match &result {
            Ok(()) => {
                tracing::debug!(object_id = self.marker.object_id(), "log entry reconciled");
                true
            }
            Err(error @ Error::MalformedRecord(_)) => {
                tracing::warn!(
                    object_id = self.marker.object_id(),
                    %error,
                    "log entry failed permanently, removing it"
                );
                true
            }
            Err(error) => {
                tracing::warn!(
                    object_id = self.marker.object_id(),
                    %error,
                    "log entry failed, leaving it for the next scan"
                );
                false
            }
        };

        if remove_record {
            if let Err(error) = self.log.delete(&self.marker).await {
                tracing::warn!(
                    object_id = self.marker.object_id(),
                    %error,
                    "failed to delete reconciled record"
                );
            }
        }

        if let Some(in_flight) = &self.in_flight {
            in_flight.lock().remove(&self.marker);
        }
    }

    /// Release the in-flight slot without touching the record; used when
    /// an entry is deferred to the next scan
    pub fn defer(self) {
        if let Some(in_flight) = &self.in_flight {
            in_flight.lock().remove(&self.marker);
        }
    }
}

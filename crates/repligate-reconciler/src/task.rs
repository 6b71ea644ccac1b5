//! Migration task model

use crate::hook::RecordHook;
use repligate_common::Keys;
use repligate_watchdog::ConsistencyRecord;

/// Enough to talk to one replica: its endpoint and the backend keys
/// resolved for the record's access key. Tasks reference replicas by
/// endpoint, never by a handle into the ring, so a task never outlives
/// or pins routing state.
#[derive(Clone, Debug)]
pub struct MigrationAuth {
    pub endpoint: String,
    pub keys: Keys,
}

/// One unit of reconciliation work.
///
/// PUT records copy from `source` to each destination; DELETE records
/// (and old-shard cleanup) only need destinations. The hook, when
/// present, must fire exactly once after the task ran.
pub struct WalTask {
    pub record: ConsistencyRecord,
    pub source: Option<MigrationAuth>,
    pub destinations: Vec<MigrationAuth>,
    pub hook: Option<RecordHook>,
}

impl WalTask {
    /// A task with no work and no hook carries no information
    #[must_use]
    pub fn is_droppable(&self) -> bool {
        self.source.is_none() && self.destinations.is_empty() && self.hook.is_none()
    }
}

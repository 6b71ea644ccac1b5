//! Reconciler pipeline
//!
//! `scan → filter → executor lanes → hook`, connected by bounded
//! channels. The scanner polls the log for due entries; the filter (a
//! single task, owning the ring cache) plans each entry; the plan's
//! tasks go to one of K executor lanes picked by hashing the object id,
//! so work on one object is always serialized. Within a lane an entry's
//! tasks run in order and a failure skips the rest, so old-shard cleanup
//! never runs after a failed migration.

use crate::executor::MigrationExecutor;
use crate::filter::WalFilter;
use crate::hook::RecordHook;
use crate::task::WalTask;
use chrono::Utc;
use parking_lot::Mutex;
use repligate_common::{Error, Method};
use repligate_watchdog::{ConsistencyLog, DeleteMarker, WalEntry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use xxhash_rust::xxh64::xxh64;

/// Pipeline settings
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub scan_interval: Duration,
    /// Entries pulled per scan
    pub batch_limit: usize,
    /// Executor lanes; entries for one object always share a lane
    pub lanes: usize,
    /// Queued entries per lane before the scanner blocks
    pub lane_depth: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { scan_interval: Duration::from_secs(30), batch_limit: 256, lanes: 4, lane_depth: 16 }
    }
}

/// The background reconciliation driver
pub struct Reconciler {
    config: ReconcilerConfig,
    log: Arc<dyn ConsistencyLog>,
    filter: WalFilter,
    executor: Arc<MigrationExecutor>,
    in_flight: Arc<Mutex<HashSet<DeleteMarker>>>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        log: Arc<dyn ConsistencyLog>,
        filter: WalFilter,
        executor: MigrationExecutor,
    ) -> Self {
        Self {
            config,
            log,
            filter,
            executor: Arc::new(executor),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run until `shutdown` flips; drains the lanes before returning
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let lanes = self.config.lanes.max(1);
        let mut lane_txs = Vec::with_capacity(lanes);
        let mut lane_handles = Vec::with_capacity(lanes);

        for lane in 0..lanes {
            let (tx, mut rx) = mpsc::channel::<Vec<WalTask>>(self.config.lane_depth);
            let executor = Arc::clone(&self.executor);
            lane_handles.push(tokio::spawn(async move {
                while let Some(group) = rx.recv().await {
                    run_task_group(&executor, group).await;
                }
                tracing::debug!(lane, "executor lane drained");
            }));
            lane_txs.push(tx);
        }

        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan(&lane_txs).await,
                _ = shutdown.changed() => break,
            }
        }

        drop(lane_txs);
        for handle in lane_handles {
            handle.await.ok();
        }
        tracing::info!("reconciler stopped");
    }

    /// One scan pass over the due entries
    pub async fn scan(&mut self, lanes: &[mpsc::Sender<Vec<WalTask>>]) {
        let due = match self.log.due_records(Utc::now(), self.config.batch_limit).await {
            Ok(due) => due,
            Err(error) => {
                tracing::warn!(%error, "scanning the consistency log failed");
                return;
            }
        };

        for entry in due {
            if !self.in_flight.lock().insert(entry.marker.clone()) {
                // Still being worked on from an earlier scan
                continue;
            }
            self.process_entry(entry, lanes).await;
        }
    }

    async fn process_entry(&mut self, entry: WalEntry, lanes: &[mpsc::Sender<Vec<WalTask>>]) {
        let hook = RecordHook::new(
            Arc::clone(&self.log),
            entry.marker.clone(),
            Some(Arc::clone(&self.in_flight)),
        );

        let outcome = match self.filter.process(&entry.record).await {
            Ok(outcome) => outcome,
            Err(error @ Error::MalformedRecord(_)) => {
                hook.complete(Err(error)).await;
                return;
            }
            Err(error) => {
                tracing::debug!(
                    object_id = %entry.record.object_id,
                    %error,
                    "deferring entry to the next scan"
                );
                hook.defer();
                return;
            }
        };

        let mut tasks = Vec::new();
        if let Some(migration) = outcome.migration {
            tasks.push(WalTask {
                record: entry.record.clone(),
                source: migration.source,
                destinations: migration.destinations,
                hook: None,
            });
        }
        if !outcome.cleanup.is_empty() {
            let mut cleanup_record = entry.record.clone();
            cleanup_record.method = Method::Delete;
            tasks.push(WalTask {
                record: cleanup_record,
                source: None,
                destinations: outcome.cleanup,
                hook: None,
            });
        }

        match tasks.last_mut() {
            Some(last) => last.hook = Some(hook),
            None => {
                // Nothing to move: the entry is settled (obsolete,
                // nowhere-present or legacy-only)
                hook.complete(Ok(())).await;
                return;
            }
        }

        let lane = (xxh64(entry.record.object_id.as_bytes(), 0) as usize) % lanes.len();
        if lanes[lane].send(tasks).await.is_err() {
            tracing::warn!("executor lane closed, dropping task group");
        }
    }
}

/// Run one entry's tasks in order; a failure skips the remaining tasks
/// and reaches the hook as the group's result.
async fn run_task_group(executor: &MigrationExecutor, group: Vec<WalTask>) {
    let mut failure: Option<Error> = None;
    for mut task in group {
        let hook = task.hook.take();

        if failure.is_none() {
            if let Err(error) = executor.run(&task).await {
                tracing::warn!(
                    object_id = %task.record.object_id,
                    version = task.record.object_version,
                    %error,
                    "task failed, skipping the rest of the entry"
                );
                failure = Some(error);
            }
        }

        if let Some(hook) = hook {
            let result = match &failure {
                None => Ok(()),
                Some(error) => Err(error.clone()),
            };
            hook.complete(result).await;
        }
    }
}

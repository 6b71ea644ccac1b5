//! WAL filter: turns a due log entry into migration and cleanup plans
//!
//! For each entry the filter resolves the region ring, surveys every
//! replica of every shard for the object's version, and decides what has
//! to move:
//!
//! * a replica in the target shard newer than the record makes the entry
//!   obsolete (a newer entry exists for it);
//! * a PUT that no replica holds yet has nothing to propagate;
//! * replicas holding only legacy (unversioned) copies are left alone;
//! * otherwise the recorded version is copied onto stale and missing
//!   target replicas, deletes are finished on replicas still holding the
//!   object, and copies on shards outside the target are cleared.
//!
//! The domain → ring cache is owned by the single filter task; it
//! refreshes whenever the region router publishes a new generation.

use crate::fetcher::{StorageState, VersionFetcher};
use crate::task::MigrationAuth;
use repligate_auth::CredentialStore;
use repligate_common::{Error, Method, ObjectRef, Result};
use repligate_sharding::{RegionRouter, ShardsRing};
use repligate_storages::ShardClient;
use repligate_watchdog::ConsistencyRecord;
use std::collections::HashMap;
use std::sync::Arc;

/// Migration plan for the target shard
#[derive(Debug)]
pub struct Migration {
    /// Replica to copy from; `None` for DELETE reconciliation
    pub source: Option<MigrationAuth>,
    pub destinations: Vec<MigrationAuth>,
}

/// What the filter decided for one entry
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub migration: Option<Migration>,
    /// Replicas outside the target shard to clear the object from
    pub cleanup: Vec<MigrationAuth>,
}

impl FilterOutcome {
    fn drop_entry() -> Self {
        Self::default()
    }
}

struct ReplicaState {
    state: StorageState,
    auth: MigrationAuth,
    maintenance: bool,
}

struct CachedRing {
    ring: Arc<ShardsRing>,
    generation: u64,
}

/// Consults the storages to determine the desired state of an object
pub struct WalFilter {
    router: Arc<RegionRouter>,
    fetcher: Arc<dyn VersionFetcher>,
    store: Arc<dyn CredentialStore>,
    rings: HashMap<String, CachedRing>,
}

impl WalFilter {
    pub fn new(
        router: Arc<RegionRouter>,
        fetcher: Arc<dyn VersionFetcher>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self { router, fetcher, store, rings: HashMap::new() }
    }

    /// Plan the reconciliation of one record.
    ///
    /// `Err(MalformedRecord)` is permanent; any other error defers the
    /// entry to the next scan.
    pub async fn process(&mut self, record: &ConsistencyRecord) -> Result<FilterOutcome> {
        let object = ObjectRef::from_object_id(&record.object_id)
            .map_err(|e| Error::MalformedRecord(format!("{}: {e}", record.object_id)))?;

        let ring = self.ring_for(&record.domain)?;
        let path = format!("/{}", record.object_id);
        let (target_name, _) = ring.pick(&path)?;
        let target_name = target_name.to_string();

        tracing::debug!(
            request_id = %record.request_id,
            object_id = %record.object_id,
            version = record.object_version,
            target = %target_name,
            "processing log entry"
        );

        let mut target_replicas = Vec::new();
        let mut other_replicas = Vec::new();
        for (shard_name, shard) in ring.shards() {
            let replicas = self.survey_shard(record, &object, shard).await?;
            if *shard_name == target_name {
                target_replicas = replicas;
            } else {
                other_replicas.extend(replicas);
            }
        }

        Ok(Self::plan(record, &target_replicas, &other_replicas))
    }

    fn plan(
        record: &ConsistencyRecord,
        target_replicas: &[ReplicaState],
        other_replicas: &[ReplicaState],
    ) -> FilterOutcome {
        let version = record.object_version;
        let target_with: Vec<&ReplicaState> =
            target_replicas.iter().filter(|r| !r.state.absent).collect();

        // A newer copy on the target shard means a newer log entry
        // exists; this one is superseded.
        if target_with.iter().any(|r| r.state.version > version) {
            tracing::debug!(
                object_id = %record.object_id,
                version,
                "entry superseded by a newer version on the target shard"
            );
            return FilterOutcome::drop_entry();
        }

        let all_with: Vec<&ReplicaState> = target_replicas
            .iter()
            .chain(other_replicas.iter())
            .filter(|r| !r.state.absent)
            .collect();

        // Nothing to propagate: the write never landed anywhere
        if record.method == Method::Put && all_with.is_empty() {
            tracing::debug!(
                object_id = %record.object_id,
                "object is not present on any storage"
            );
            return FilterOutcome::drop_entry();
        }

        // Only unversioned copies exist: they predate the log, leave
        // them in place
        let all_legacy = !all_with.is_empty() && all_with.iter().all(|r| r.state.version == -1);

        let migration = if all_legacy {
            None
        } else {
            match record.method {
                Method::Put => Self::plan_put(version, &target_with, &all_with, target_replicas),
                Method::Delete => Self::plan_delete(&target_with),
            }
        };

        // Clearing old shards is only safe once the target shard holds
        // the object (or the entry is finishing a delete).
        let cleanup_allowed = record.method == Method::Delete
            || migration.is_some()
            || !target_with.is_empty();
        let cleanup = if cleanup_allowed {
            other_replicas
                .iter()
                .filter(|r| !r.state.absent && !r.maintenance && r.state.version <= version)
                .map(|r| r.auth.clone())
                .collect()
        } else {
            Vec::new()
        };

        FilterOutcome { migration, cleanup }
    }

    fn plan_put(
        version: i64,
        target_with: &[&ReplicaState],
        all_with: &[&ReplicaState],
        target_replicas: &[ReplicaState],
    ) -> Option<Migration> {
        // Prefer a target-shard source; after a topology change the only
        // replica at the recorded version may live on an old shard.
        let source = target_with
            .iter()
            .find(|r| r.state.version == version)
            .or_else(|| all_with.iter().find(|r| r.state.version == version))
            .map(|r| r.auth.clone())?;

        let destinations: Vec<MigrationAuth> = target_replicas
            .iter()
            .filter(|r| !r.maintenance)
            .filter(|r| r.state.absent || r.state.version < version)
            .map(|r| r.auth.clone())
            .collect();

        if destinations.is_empty() {
            return None;
        }
        Some(Migration { source: Some(source), destinations })
    }

    fn plan_delete(target_with: &[&ReplicaState]) -> Option<Migration> {
        let destinations: Vec<MigrationAuth> = target_with
            .iter()
            .filter(|r| !r.maintenance)
            .map(|r| r.auth.clone())
            .collect();
        if destinations.is_empty() {
            return None;
        }
        Some(Migration { source: None, destinations })
    }

    async fn survey_shard(
        &self,
        record: &ConsistencyRecord,
        object: &ObjectRef,
        shard: &ShardClient,
    ) -> Result<Vec<ReplicaState>> {
        let mut replicas = Vec::with_capacity(shard.backends().len());
        for backend in shard.backends() {
            let keys = self
                .store
                .fetch_credentials(&record.access_key, backend.name())
                .await
                .map_err(|e| {
                    Error::Transport(format!(
                        "resolving keys for storage {} failed: {e}",
                        backend.name()
                    ))
                })?;
            let auth = MigrationAuth { endpoint: backend.endpoint().to_string(), keys };
            let state = self
                .fetcher
                .fetch(&auth, object.bucket(), object.key())
                .await
                .map_err(|e| {
                    Error::Transport(format!(
                        "version fetch on {} failed: {e}",
                        backend.endpoint()
                    ))
                })?;
            replicas.push(ReplicaState { state, auth, maintenance: backend.maintenance() });
        }
        Ok(replicas)
    }

    fn ring_for(&mut self, domain: &str) -> Result<Arc<ShardsRing>> {
        let current = self.router.generation();
        if let Some(cached) = self.rings.get(domain) {
            if cached.generation == current {
                return Ok(Arc::clone(&cached.ring));
            }
        }
        let (consistent, generation) = self
            .router
            .ring_for_domain(domain)
            .ok_or_else(|| Error::RegionNotFound(domain.to_string()))?;
        let ring = Arc::clone(consistent.shards_ring());
        self.rings
            .insert(domain.to_string(), CachedRing { ring: Arc::clone(&ring), generation });
        Ok(ring)
    }
}

//! Wires the configuration into running components
//!
//! Builds the credential store, the per-storage backend clients, the
//! shard clients and the per-region consistent rings. Rebuilding on
//! reload reuses the same credential store and consistency log; only the
//! routing layer is replaced.

use anyhow::{anyhow, Context, Result};
use chrono::Duration as ChronoDuration;
use repligate_auth::{
    CachingCredentialStore, CredentialStore, MemoryCredentialStore, VaultCredentialStore,
};
use repligate_common::config::{CredentialsConfig, StorageAuth};
use repligate_common::ProxyConfig;
use repligate_sharding::{ConsistentRing, RingProps, ShardsRing};
use repligate_storages::{BackendAuth, BackendClient, ShardClient};
use repligate_watchdog::ConsistencyLog;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// TTL for cached credential lookups
const CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(300);

/// Build the credential store selected by the config
pub fn build_credential_store(config: &ProxyConfig) -> Result<Arc<dyn CredentialStore>> {
    let inner: Arc<dyn CredentialStore> = match &config.credentials {
        CredentialsConfig::Memory { entries } => Arc::new(MemoryCredentialStore::from_triples(
            entries
                .iter()
                .map(|e| (e.access_key.clone(), e.storage.clone(), e.keys.clone())),
        )),
        CredentialsConfig::Vault { endpoint, path_prefix, token, timeout_ms } => {
            let token = token
                .clone()
                .or_else(|| std::env::var("REPLIGATE_VAULT_TOKEN").ok())
                .ok_or_else(|| anyhow!("vault credential store configured without a token"))?;
            Arc::new(
                VaultCredentialStore::new(
                    endpoint.clone(),
                    path_prefix.clone(),
                    token,
                    Duration::from_millis(*timeout_ms),
                )
                .map_err(|e| anyhow!("building vault store: {e}"))?,
            )
        }
    };
    Ok(Arc::new(CachingCredentialStore::new(inner, CREDENTIAL_CACHE_TTL)))
}

/// Build the domain → ring map from a validated config
pub fn build_regions(
    config: &ProxyConfig,
    store: &Arc<dyn CredentialStore>,
    log: &Arc<dyn ConsistencyLog>,
    http_client: &reqwest::Client,
) -> Result<HashMap<String, Arc<ConsistentRing>>> {
    let timeout = Duration::from_millis(config.client.round_trip_timeout_ms);

    let mut backends: HashMap<String, Arc<BackendClient>> = HashMap::new();
    for (name, storage) in &config.storages {
        let auth = match &storage.auth {
            StorageAuth::Passthrough => BackendAuth::Passthrough,
            StorageAuth::FixedKey { keys } => BackendAuth::FixedKey { keys: keys.clone() },
            StorageAuth::AuthService => BackendAuth::AuthService { store: Arc::clone(store) },
        };
        let client = BackendClient::new(
            name.clone(),
            storage.endpoint.clone(),
            storage.maintenance,
            auth,
            http_client.clone(),
            timeout,
        )
        .map_err(|e| anyhow!("storage {name}: {e}"))?;
        backends.insert(name.clone(), Arc::new(client));
    }

    let mut shards: HashMap<String, Arc<ShardClient>> = HashMap::new();
    for (name, shard) in &config.shards {
        let replicas = shard
            .storages
            .iter()
            .map(|storage| {
                backends
                    .get(storage)
                    .cloned()
                    .ok_or_else(|| anyhow!("shard {name} references unknown storage {storage}"))
            })
            .collect::<Result<Vec<_>>>()?;
        shards.insert(name.clone(), Arc::new(ShardClient::new(name.clone(), replicas)));
    }

    let mut regions = HashMap::new();
    for (region_name, region) in &config.regions {
        let weighted: Vec<(String, f64)> = region
            .shards
            .iter()
            .map(|policy| (policy.shard.clone(), policy.weight))
            .collect();
        let region_shards: BTreeMap<String, Arc<ShardClient>> = region
            .shards
            .iter()
            .map(|policy| {
                shards
                    .get(&policy.shard)
                    .cloned()
                    .map(|shard| (policy.shard.clone(), shard))
                    .ok_or_else(|| {
                        anyhow!("region {region_name} references unknown shard {}", policy.shard)
                    })
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let ring = ShardsRing::new(
            &weighted,
            region_shards,
            RingProps {
                consistency_level: region.consistency_level,
                read_repair: region.read_repair,
            },
            config.watchdog.object_version_header_name.clone(),
        )
        .with_context(|| format!("building ring for region {region_name}"))?;

        let gate = Arc::new(ConsistentRing::new(
            Arc::new(ring),
            Arc::clone(log),
            ChronoDuration::seconds(config.watchdog.record_delay_secs),
            ChronoDuration::seconds(config.watchdog.multipart_delta_secs),
        ));

        for domain in &region.domains {
            regions.insert(domain.clone(), Arc::clone(&gate));
        }
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use repligate_watchdog::testing::MemoryConsistencyLog;

    fn sample_config() -> ProxyConfig {
        ProxyConfig::from_yaml(
            r#"
listen: "127.0.0.1:8080"
technical_endpoint_listen: "127.0.0.1:8071"
storages:
  dc1-a:
    endpoint: "http://s3-a.dc1:9000"
  dc1-b:
    endpoint: "http://s3-b.dc1:9000"
    maintenance: true
shards:
  shard-1:
    storages: [dc1-a, dc1-b]
regions:
  eu:
    domains: ["s3.example.com", "s3.alt.example.com"]
    shards:
      - shard: shard-1
        weight: 1.0
    consistency_level: weak
credentials:
  kind: memory
  entries: []
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_regions_built_per_domain() {
        let config = sample_config();
        config.validate().unwrap();
        let store = build_credential_store(&config).unwrap();
        let log: Arc<dyn ConsistencyLog> = Arc::new(MemoryConsistencyLog::new());
        let regions =
            build_regions(&config, &store, &log, &reqwest::Client::new()).unwrap();

        assert_eq!(regions.len(), 2);
        let gate = &regions["s3.example.com"];
        assert_eq!(gate.shards_ring().shards().len(), 1);
        // Both domains share one gate
        assert!(Arc::ptr_eq(gate, &regions["s3.alt.example.com"]));
    }
}

//! Configuration model for Repligate
//!
//! The proxy is configured from a single YAML document. Parsing is plain
//! serde; `ProxyConfig::validate` performs the cross-field checks (shard
//! references, ring weights, regression-cycle preconditions) that serde
//! cannot express.

use crate::types::{parse_body_size, ConsistencyLevel, Keys};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Root configuration for the proxy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Client-facing listen address, e.g. "0.0.0.0:8080"
    pub listen: String,
    /// Technical endpoint listen address (config validation, metrics, health)
    pub technical_endpoint_listen: String,
    /// Maximum accepted request body size ("100MB", "1g", plain bytes)
    #[serde(default = "default_body_max_size")]
    pub body_max_size: String,
    /// Storage backends by name
    pub storages: BTreeMap<String, StorageConfig>,
    /// Shards by name; each shard is a replica set of storages
    pub shards: BTreeMap<String, ShardConfig>,
    /// Regions by name; each region owns a ring of shards
    pub regions: BTreeMap<String, RegionConfig>,
    /// Consistency watchdog settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Credential store settings
    pub credentials: CredentialsConfig,
    /// Outgoing HTTP client settings
    #[serde(default)]
    pub client: ClientConfig,
}

fn default_body_max_size() -> String {
    "100MB".to_string()
}

impl ProxyConfig {
    /// Parse a YAML document
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Maximum body size in bytes
    pub fn body_max_size_bytes(&self) -> Result<u64, ConfigError> {
        parse_body_size(&self.body_max_size).map_err(ConfigError::Invalid)
    }

    /// Cross-field validation; returns the first violation found
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Invalid(format!("bad listen address: {}", self.listen)))?;
        self.technical_endpoint_listen
            .parse::<SocketAddr>()
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "bad technical endpoint address: {}",
                    self.technical_endpoint_listen
                ))
            })?;
        self.body_max_size_bytes()?;

        if self.storages.is_empty() {
            return Err(ConfigError::Invalid("no storages defined".into()));
        }
        for (name, storage) in &self.storages {
            if !storage.endpoint.starts_with("http://") && !storage.endpoint.starts_with("https://")
            {
                return Err(ConfigError::Invalid(format!(
                    "storage {name}: endpoint must be an http(s) URL, got {}",
                    storage.endpoint
                )));
            }
        }

        for (name, shard) in &self.shards {
            if shard.storages.is_empty() {
                return Err(ConfigError::Invalid(format!("shard {name} has no storages")));
            }
            for storage in &shard.storages {
                if !self.storages.contains_key(storage) {
                    return Err(ConfigError::Invalid(format!(
                        "shard {name} references unknown storage {storage}"
                    )));
                }
            }
        }

        let mut seen_domains = BTreeMap::new();
        for (name, region) in &self.regions {
            if region.shards.is_empty() {
                return Err(ConfigError::Invalid(format!("region {name} has no shards")));
            }
            if region.domains.is_empty() {
                return Err(ConfigError::Invalid(format!("region {name} has no domains")));
            }
            for policy in &region.shards {
                if !self.shards.contains_key(&policy.shard) {
                    return Err(ConfigError::Invalid(format!(
                        "region {name} references unknown shard {}",
                        policy.shard
                    )));
                }
                if !(0.0..=1.0).contains(&policy.weight) {
                    return Err(ConfigError::Invalid(format!(
                        "region {name}, shard {}: weight {} outside [0, 1]",
                        policy.shard, policy.weight
                    )));
                }
            }
            let mut names: Vec<&str> = region.shards.iter().map(|p| p.shard.as_str()).collect();
            names.sort_unstable();
            names.dedup();
            if names.len() != region.shards.len() {
                return Err(ConfigError::Invalid(format!(
                    "region {name} lists a shard more than once"
                )));
            }
            for domain in &region.domains {
                if let Some(other) = seen_domains.insert(domain.clone(), name.clone()) {
                    return Err(ConfigError::Invalid(format!(
                        "domain {domain} claimed by both {other} and {name}"
                    )));
                }
            }
        }

        if self.watchdog.worker_lanes == 0 {
            return Err(ConfigError::Invalid("watchdog.worker_lanes must be >= 1".into()));
        }

        Ok(())
    }
}

/// One storage backend
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend base URL, e.g. "http://s3.dc1.internal:9000"
    pub endpoint: String,
    /// Maintenance backends receive no new writes but are still read by
    /// the reconciler
    #[serde(default)]
    pub maintenance: bool,
    /// How requests to this backend are authorized
    #[serde(default)]
    pub auth: StorageAuth,
}

/// Backend authorization mode
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageAuth {
    /// Forward the client's signature untouched
    #[default]
    Passthrough,
    /// Verify and re-sign with one fixed key pair
    FixedKey { keys: Keys },
    /// Verify against proxy-side credentials, re-sign with per-access-key
    /// backend credentials from the credential store
    AuthService,
}

/// A replica set of storages
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardConfig {
    pub storages: Vec<String>,
}

/// One shard's membership in a region ring
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardPolicy {
    pub shard: String,
    /// Ring weight in [0, 1]; the ring uses floor(weight * 100) points
    pub weight: f64,
}

/// A region: domains served, shard ring, consistency policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Host-header domains routed to this region
    pub domains: Vec<String>,
    pub shards: Vec<ShardPolicy>,
    #[serde(default)]
    pub consistency_level: ConsistencyLevel,
    #[serde(default)]
    pub read_repair: bool,
}

/// Consistency watchdog settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Header carrying the object version into backend metadata.
    /// Must be an x-amz-meta-* header so backends persist it.
    #[serde(default = "default_version_header")]
    pub object_version_header_name: String,
    /// Path of the consistency log database
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    /// Delay before a fresh record becomes due, in seconds
    #[serde(default = "default_record_delay_secs")]
    pub record_delay_secs: i64,
    /// Signed shift applied to a record's execution date when a multipart
    /// upload completes; negative pulls the deadline earlier
    #[serde(default = "default_multipart_delta_secs")]
    pub multipart_delta_secs: i64,
    /// Reconciler scan interval in milliseconds
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Number of reconciler executor lanes
    #[serde(default = "default_worker_lanes")]
    pub worker_lanes: usize,
    /// Concurrent transfers within one migration task
    #[serde(default = "default_migration_concurrency")]
    pub migration_concurrency: usize,
}

fn default_version_header() -> String {
    "x-amz-meta-object-version".to_string()
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/lib/repligate/consistency.redb")
}

fn default_record_delay_secs() -> i64 {
    300
}

fn default_multipart_delta_secs() -> i64 {
    -(7 * 24 * 60 * 60)
}

fn default_scan_interval_ms() -> u64 {
    30_000
}

fn default_worker_lanes() -> usize {
    4
}

fn default_migration_concurrency() -> usize {
    4
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            object_version_header_name: default_version_header(),
            log_path: default_log_path(),
            record_delay_secs: default_record_delay_secs(),
            multipart_delta_secs: default_multipart_delta_secs(),
            scan_interval_ms: default_scan_interval_ms(),
            worker_lanes: default_worker_lanes(),
            migration_concurrency: default_migration_concurrency(),
        }
    }
}

/// Credential store selection
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialsConfig {
    /// Static credentials from the config file
    Memory { entries: Vec<MemoryCredential> },
    /// Vault KV backend
    Vault {
        endpoint: String,
        path_prefix: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_vault_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_vault_timeout_ms() -> u64 {
    2_000
}

/// One static credential mapping: (client access key, storage name) -> keys
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryCredential {
    pub access_key: String,
    pub storage: String,
    pub keys: Keys,
}

/// Outgoing HTTP client settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-replica round-trip timeout in milliseconds
    #[serde(default = "default_round_trip_timeout_ms")]
    pub round_trip_timeout_ms: u64,
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Idle connections kept per backend host
    #[serde(default = "default_idle_per_host")]
    pub idle_per_host: usize,
}

fn default_round_trip_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_idle_per_host() -> usize {
    32
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            round_trip_timeout_ms: default_round_trip_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_per_host: default_idle_per_host(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// The YAML document did not parse
    #[error("config parse error: {0}")]
    Parse(String),
    /// The document parsed but violates a constraint
    #[error("config validation error: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
listen: "0.0.0.0:8080"
technical_endpoint_listen: "127.0.0.1:8071"
body_max_size: "50MB"
storages:
  dc1-a:
    endpoint: "http://s3-a.dc1:9000"
    auth:
      kind: auth_service
  dc1-b:
    endpoint: "http://s3-b.dc1:9000"
    maintenance: true
    auth:
      kind: auth_service
shards:
  shard-1:
    storages: [dc1-a, dc1-b]
regions:
  eu:
    domains: ["s3.example.com"]
    shards:
      - shard: shard-1
        weight: 1.0
    consistency_level: strong
    read_repair: true
credentials:
  kind: memory
  entries:
    - access_key: AKIDEXAMPLE
      storage: dc1-a
      keys: { access: AKIDBACKEND, secret: hunter2 }
"#
    }

    #[test]
    fn test_parse_and_validate_sample() {
        let config = ProxyConfig::from_yaml(sample_yaml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.body_max_size_bytes().unwrap(), 50 * 1024 * 1024);
        assert!(config.storages["dc1-b"].maintenance);
        let region = &config.regions["eu"];
        assert_eq!(region.consistency_level, ConsistencyLevel::Strong);
        assert!(region.read_repair);
    }

    #[test]
    fn test_unknown_shard_reference_rejected() {
        let mut config = ProxyConfig::from_yaml(sample_yaml()).unwrap();
        config
            .regions
            .get_mut("eu")
            .unwrap()
            .shards
            .push(ShardPolicy { shard: "missing".into(), weight: 0.5 });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_out_of_range_weight_rejected() {
        let mut config = ProxyConfig::from_yaml(sample_yaml()).unwrap();
        config.regions.get_mut("eu").unwrap().shards[0].weight = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let mut config = ProxyConfig::from_yaml(sample_yaml()).unwrap();
        let eu = config.regions["eu"].clone();
        config.regions.insert("us".into(), eu);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_listen_address_rejected() {
        let mut config = ProxyConfig::from_yaml(sample_yaml()).unwrap();
        config.listen = "not-an-address".into();
        assert!(config.validate().is_err());
    }
}

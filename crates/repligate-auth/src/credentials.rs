//! Credential store
//!
//! Resolves (client access key, storage name) pairs to the backend key
//! pair used for re-signing. Two implementations: a static in-memory map
//! built from the config file, and a Vault KV backend over HTTP. Both are
//! normally wrapped in a TTL cache, since the store sits on the hot path
//! of every authorized request.

use crate::error::CredentialsError;
use async_trait::async_trait;
use parking_lot::RwLock;
use repligate_common::Keys;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Credential resolution contract
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the key pair for `access_key` scoped to `storage_name`
    async fn fetch_credentials(
        &self,
        access_key: &str,
        storage_name: &str,
    ) -> Result<Keys, CredentialsError>;
}

/// Static credentials from configuration
pub struct MemoryCredentialStore {
    entries: HashMap<(String, String), Keys>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new(entries: HashMap<(String, String), Keys>) -> Self {
        Self { entries }
    }

    /// Build from (access_key, storage, keys) triples
    pub fn from_triples<I>(triples: I) -> Self
    where
        I: IntoIterator<Item = (String, String, Keys)>,
    {
        Self {
            entries: triples
                .into_iter()
                .map(|(access, storage, keys)| ((access, storage), keys))
                .collect(),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn fetch_credentials(
        &self,
        access_key: &str,
        storage_name: &str,
    ) -> Result<Keys, CredentialsError> {
        self.entries
            .get(&(access_key.to_string(), storage_name.to_string()))
            .cloned()
            .ok_or(CredentialsError::NotFound)
    }
}

/// Vault KV credential backend.
///
/// Reads `{path_prefix}/{access_key}/{storage_name}` and expects a KV v2
/// payload whose data carries `access_key` and `secret_key` fields.
pub struct VaultCredentialStore {
    client: reqwest::Client,
    endpoint: String,
    path_prefix: String,
    token: String,
}

impl VaultCredentialStore {
    pub fn new(
        endpoint: impl Into<String>,
        path_prefix: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CredentialsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialsError::Transient(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            path_prefix: path_prefix.into(),
            token: token.into(),
        })
    }

    fn parse_response(value: &serde_json::Value) -> Result<Keys, CredentialsError> {
        let data = value
            .get("data")
            .and_then(|d| d.get("data"))
            .ok_or(CredentialsError::NotFound)?;
        let fields = data.as_object().ok_or(CredentialsError::InvalidFormat)?;
        let access = fields
            .get("access_key")
            .ok_or(CredentialsError::MissingAccessKey)?
            .as_str()
            .ok_or(CredentialsError::InvalidFormat)?;
        let secret = fields
            .get("secret_key")
            .ok_or(CredentialsError::MissingSecretKey)?
            .as_str()
            .ok_or(CredentialsError::InvalidFormat)?;
        Ok(Keys { access: access.to_string(), secret: secret.to_string() })
    }
}

#[async_trait]
impl CredentialStore for VaultCredentialStore {
    async fn fetch_credentials(
        &self,
        access_key: &str,
        storage_name: &str,
    ) -> Result<Keys, CredentialsError> {
        let url = format!(
            "{}/v1/{}/{}/{}",
            self.endpoint, self.path_prefix, access_key, storage_name
        );
        tracing::debug!(access_key, storage_name, "fetching credentials from vault");

        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| CredentialsError::Transient(e.to_string()))?;

        match response.status().as_u16() {
            200 => {}
            404 => return Err(CredentialsError::NotFound),
            status => {
                return Err(CredentialsError::Transient(format!(
                    "vault returned status {status}"
                )))
            }
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|_| CredentialsError::InvalidFormat)?;
        Self::parse_response(&body)
    }
}

/// TTL cache wrapper around any credential store
pub struct CachingCredentialStore {
    inner: Arc<dyn CredentialStore>,
    cache: RwLock<HashMap<(String, String), CachedKeys>>,
    ttl: Duration,
}

#[derive(Clone)]
struct CachedKeys {
    keys: Keys,
    cached_at: Instant,
}

impl CachingCredentialStore {
    pub fn new(inner: Arc<dyn CredentialStore>, ttl: Duration) -> Self {
        Self { inner, cache: RwLock::new(HashMap::new()), ttl }
    }
}

#[async_trait]
impl CredentialStore for CachingCredentialStore {
    async fn fetch_credentials(
        &self,
        access_key: &str,
        storage_name: &str,
    ) -> Result<Keys, CredentialsError> {
        let cache_key = (access_key.to_string(), storage_name.to_string());
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(&cache_key) {
                if entry.cached_at.elapsed() < self.ttl {
                    return Ok(entry.keys.clone());
                }
            }
        }

        let keys = self.inner.fetch_credentials(access_key, storage_name).await?;
        self.cache.write().insert(
            cache_key,
            CachedKeys { keys: keys.clone(), cached_at: Instant::now() },
        );
        Ok(keys)
    }
}

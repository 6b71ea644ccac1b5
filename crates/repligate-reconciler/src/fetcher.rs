//! Version fetcher
//!
//! Asks one replica which version of an object it holds, by HEADing the
//! object and reading the version header the proxy stamped at write
//! time. Objects written before versioning was enabled have no header
//! and report version -1; they are legacy and must not be overwritten.

use crate::task::MigrationAuth;
use async_trait::async_trait;
use repligate_auth::sigv2;
use repligate_common::{Error, Result};

/// What one replica knows about one object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageState {
    pub endpoint: String,
    /// -1 when absent or when the object predates versioning
    pub version: i64,
    pub absent: bool,
}

/// Per-replica version lookup
#[async_trait]
pub trait VersionFetcher: Send + Sync {
    async fn fetch(&self, auth: &MigrationAuth, bucket: &str, key: &str)
        -> Result<StorageState>;
}

/// HEAD-based fetcher against real S3 backends
pub struct S3VersionFetcher {
    client: reqwest::Client,
    version_header: String,
}

impl S3VersionFetcher {
    pub fn new(client: reqwest::Client, version_header: impl Into<String>) -> Self {
        Self { client, version_header: version_header.into() }
    }
}

#[async_trait]
impl VersionFetcher for S3VersionFetcher {
    async fn fetch(
        &self,
        auth: &MigrationAuth,
        bucket: &str,
        key: &str,
    ) -> Result<StorageState> {
        let path = format!("/{bucket}/{key}");
        let url = format!("{}{}", auth.endpoint.trim_end_matches('/'), path);
        let host = host_of(&auth.endpoint)?;

        let mut headers = http::HeaderMap::new();
        sigv2::sign_v2(
            &http::Method::HEAD,
            &path,
            None,
            &mut headers,
            &host,
            &auth.keys.access,
            &auth.keys.secret,
        )
        .map_err(|e| Error::internal(format!("signing HEAD failed: {e}")))?;

        let response = self
            .client
            .head(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        match response.status().as_u16() {
            404 => Ok(StorageState { endpoint: auth.endpoint.clone(), version: -1, absent: true }),
            200 => {
                let version = response
                    .headers()
                    .get(&self.version_header)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(-1);
                Ok(StorageState { endpoint: auth.endpoint.clone(), version, absent: false })
            }
            status => Err(Error::Transport(format!(
                "HEAD {url} returned unexpected status {status}"
            ))),
        }
    }
}

pub(crate) fn host_of(endpoint: &str) -> Result<String> {
    let url: reqwest::Url = endpoint
        .parse()
        .map_err(|_| Error::Configuration(format!("bad endpoint url: {endpoint}")))?;
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => Ok(format!("{host}:{port}")),
        (Some(host), None) => Ok(host.to_string()),
        (None, _) => Err(Error::Configuration(format!("endpoint has no host: {endpoint}"))),
    }
}

//! Per-replica backend client
//!
//! Wraps one storage URL with credential resolution and re-signing. The
//! incoming request was already verified at the region edge; this client
//! rewrites the Authorization header for the backend host, preserving the
//! client's signature version, then forwards the buffered body. Transport
//! errors and timeouts surface as `Err`; every HTTP status, 5xx included,
//! is a normal response.

use crate::request::ProxyRequest;
use crate::response::BackendResponse;
use repligate_auth::header::{ParsedAuthHeader, SignatureVersion};
use repligate_auth::{sigv2, sigv4, CredentialStore};
use repligate_common::{Error, Keys, Result};
use std::sync::Arc;
use std::time::Duration;

/// How outgoing requests to a backend are authorized
#[derive(Clone)]
pub enum BackendAuth {
    /// Forward the client's signature untouched
    Passthrough,
    /// Re-sign every authorized request with one fixed key pair
    FixedKey { keys: Keys },
    /// Re-sign with per-access-key credentials from the store
    AuthService { store: Arc<dyn CredentialStore> },
}

/// One replica backend
pub struct BackendClient {
    name: String,
    endpoint: String,
    /// host[:port] used for signing and the Host header
    host: String,
    maintenance: bool,
    auth: BackendAuth,
    client: reqwest::Client,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        maintenance: bool,
        auth: BackendAuth,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let url: reqwest::Url = endpoint
            .parse()
            .map_err(|_| Error::Configuration(format!("bad endpoint url: {endpoint}")))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(Error::Configuration(format!("endpoint has no host: {endpoint}")))
            }
        };
        Ok(Self { name: name.into(), endpoint, host, maintenance, auth, client, timeout })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Maintenance backends receive no new writes; the reconciler still
    /// reads them
    #[must_use]
    pub fn maintenance(&self) -> bool {
        self.maintenance
    }

    /// Forward the request to this replica
    pub async fn round_trip(&self, req: &ProxyRequest) -> Result<BackendResponse> {
        let mut headers = req.headers.clone();
        self.resign(req, &mut headers).await?;

        let url = match &req.query {
            Some(query) => format!("{}{}?{}", self.endpoint, req.path, query),
            None => format!("{}{}", self.endpoint, req.path),
        };

        tracing::debug!(
            request_id = %req.context.request_id,
            backend = %self.name,
            method = %req.method,
            %url,
            "forwarding to backend"
        );

        let response = self
            .client
            .request(req.method.clone(), &url)
            .headers(headers)
            .body(req.body.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout
                } else {
                    Error::Transport(e.to_string())
                }
            })?;

        Ok(BackendResponse::from_upstream(&self.name, response))
    }

    /// Rewrite the Authorization header for this backend
    async fn resign(&self, req: &ProxyRequest, headers: &mut http::HeaderMap) -> Result<()> {
        let auth_header = match headers.get(http::header::AUTHORIZATION) {
            Some(value) => value
                .to_str()
                .map_err(|_| Error::invalid_request("authorization header is not ascii"))?
                .to_string(),
            // Anonymous requests are forwarded unsigned
            None => return Ok(()),
        };

        let keys = match &self.auth {
            BackendAuth::Passthrough => return Ok(()),
            BackendAuth::FixedKey { keys } => keys.clone(),
            BackendAuth::AuthService { store } => {
                let access_key = req
                    .context
                    .access_key
                    .as_deref()
                    .ok_or_else(|| Error::invalid_request("no access key in context"))?;
                store
                    .fetch_credentials(access_key, &self.name)
                    .await
                    .map_err(|e| Error::Transport(format!("credential fetch failed: {e}")))?
            }
        };

        let parsed: ParsedAuthHeader = repligate_auth::parse_authorization_header(&auth_header)
            .map_err(|_| Error::UnsupportedSignatureVersion)?;

        match parsed.version {
            SignatureVersion::V2 => sigv2::sign_v2(
                &req.method,
                &req.path,
                req.query.as_deref(),
                headers,
                &self.host,
                &keys.access,
                &keys.secret,
            ),
            SignatureVersion::V4 => sigv4::sign_v4(
                &req.method,
                &req.path,
                req.query.as_deref(),
                headers,
                &self.host,
                &keys.access,
                &keys.secret,
                &parsed.region,
                &parsed.service,
            ),
        }
        .map_err(|e| Error::invalid_request(format!("re-signing failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestContext;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method};
    use repligate_common::ConsistencyLevel;

    fn client(auth: BackendAuth) -> BackendClient {
        BackendClient::new(
            "dc1-a",
            "http://backend.internal:9000/",
            false,
            auth,
            reqwest::Client::new(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn signed_request() -> ProxyRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-amz-content-sha256",
            HeaderValue::from_static("UNSIGNED-PAYLOAD"),
        );
        let ctx = Arc::new(RequestContext::new(
            "s3.example.com",
            Some("AKIDCLIENT".into()),
            ConsistencyLevel::Weak,
            false,
        ));
        let mut req = ProxyRequest::new(
            Method::PUT,
            "/bucket/key",
            None,
            headers,
            Bytes::from_static(b"data"),
            ctx,
        );
        repligate_auth::sigv4::sign_v4(
            &req.method,
            &req.path,
            None,
            &mut req.headers,
            "proxy.example.com",
            "AKIDCLIENT",
            "clientsecret",
            "us-east-1",
            "s3",
        )
        .unwrap();
        req
    }

    #[test]
    fn test_endpoint_host_extraction() {
        let c = client(BackendAuth::Passthrough);
        assert_eq!(c.endpoint(), "http://backend.internal:9000");
        assert_eq!(c.host, "backend.internal:9000");
        assert!(BackendClient::new(
            "x",
            "not a url",
            false,
            BackendAuth::Passthrough,
            reqwest::Client::new(),
            Duration::from_secs(1),
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_resign_fixed_key_rewrites_host_and_credential() {
        let c = client(BackendAuth::FixedKey {
            keys: Keys { access: "AKIDBACKEND".into(), secret: "backendsecret".into() },
        });
        let req = signed_request();
        let mut headers = req.headers.clone();
        c.resign(&req, &mut headers).await.unwrap();

        let auth = headers[http::header::AUTHORIZATION].to_str().unwrap();
        assert!(auth.contains("Credential=AKIDBACKEND/"));
        assert_eq!(headers[http::header::HOST], "backend.internal:9000");

        // And the new signature verifies against the backend secret
        let parsed = repligate_auth::parse_authorization_header(auth).unwrap();
        repligate_auth::sigv4::verify_v4(
            &req.method,
            &req.path,
            None,
            &headers,
            &parsed,
            "backendsecret",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_passthrough_keeps_signature() {
        let c = client(BackendAuth::Passthrough);
        let req = signed_request();
        let original = req.headers[http::header::AUTHORIZATION].clone();
        let mut headers = req.headers.clone();
        c.resign(&req, &mut headers).await.unwrap();
        assert_eq!(headers[http::header::AUTHORIZATION], original);
    }

    #[tokio::test]
    async fn test_anonymous_requests_stay_unsigned() {
        let c = client(BackendAuth::FixedKey {
            keys: Keys { access: "A".into(), secret: "S".into() },
        });
        let ctx = Arc::new(RequestContext::new("d", None, ConsistencyLevel::None, false));
        let req = ProxyRequest::new(
            Method::GET,
            "/bucket/key",
            None,
            HeaderMap::new(),
            Bytes::new(),
            ctx,
        );
        let mut headers = req.headers.clone();
        c.resign(&req, &mut headers).await.unwrap();
        assert!(!headers.contains_key(http::header::AUTHORIZATION));
    }
}

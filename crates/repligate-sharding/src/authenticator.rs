//! Edge authentication
//!
//! Client signatures are checked once, before the consistency gate runs,
//! against the proxy-side credentials. A mismatch is answered locally
//! with 403 and neither dispatched nor recorded in the consistency log.
//! Requests without an Authorization header pass through anonymously;
//! backends decide what anonymous callers may do.

use http::{HeaderMap, Method};
use repligate_auth::header::SignatureVersion;
use repligate_auth::{parse_authorization_header, sigv2, sigv4, CredentialStore, CredentialsError};
use repligate_common::{Error, Result};
use std::sync::Arc;

/// Verifies client signatures at the region edge
pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    /// Storage name under which the proxy's own credentials are filed
    service_name: String,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>, service_name: impl Into<String>) -> Self {
        Self { store, service_name: service_name.into() }
    }

    /// Verify the request's signature. Returns the access key for
    /// authorized requests, `None` for anonymous ones.
    pub async fn authenticate(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<Option<String>> {
        let auth_header = match headers.get(http::header::AUTHORIZATION) {
            Some(value) => value.to_str().map_err(|_| Error::AccessDenied)?,
            None => return Ok(None),
        };

        let parsed = parse_authorization_header(auth_header).map_err(|error| {
            tracing::debug!(%error, "rejecting unparsable authorization header");
            Error::AccessDenied
        })?;

        let keys = self
            .store
            .fetch_credentials(&parsed.access_key, &self.service_name)
            .await
            .map_err(|error| match error {
                CredentialsError::NotFound => Error::AccessDenied,
                other => Error::Transport(format!("credential store: {other}")),
            })?;

        let verified = match parsed.version {
            SignatureVersion::V2 => {
                sigv2::verify_v2(method, path, query, headers, &parsed.signature, &keys.secret)
            }
            SignatureVersion::V4 => {
                sigv4::verify_v4(method, path, query, headers, &parsed, &keys.secret)
            }
        };

        match verified {
            Ok(()) => Ok(Some(parsed.access_key)),
            Err(error) => {
                tracing::debug!(access_key = %parsed.access_key, %error, "signature rejected");
                Err(Error::SignatureDoesNotMatch)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repligate_auth::MemoryCredentialStore;
    use repligate_common::Keys;

    fn authenticator() -> Authenticator {
        let store = MemoryCredentialStore::from_triples(vec![(
            "AKIDCLIENT".to_string(),
            "repligate".to_string(),
            Keys { access: "AKIDCLIENT".into(), secret: "clientsecret".into() },
        )]);
        Authenticator::new(Arc::new(store), "repligate")
    }

    fn signed_headers(secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-amz-content-sha256",
            http::HeaderValue::from_static("UNSIGNED-PAYLOAD"),
        );
        sigv4::sign_v4(
            &Method::GET,
            "/bucket/key",
            None,
            &mut headers,
            "s3.example.com",
            "AKIDCLIENT",
            secret,
            "us-east-1",
            "s3",
        )
        .unwrap();
        headers
    }

    #[tokio::test]
    async fn test_valid_signature_yields_access_key() {
        let auth = authenticator();
        let headers = signed_headers("clientsecret");
        let access = auth
            .authenticate(&Method::GET, "/bucket/key", None, &headers)
            .await
            .unwrap();
        assert_eq!(access.as_deref(), Some("AKIDCLIENT"));
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let auth = authenticator();
        let headers = signed_headers("wrongsecret");
        assert!(matches!(
            auth.authenticate(&Method::GET, "/bucket/key", None, &headers).await,
            Err(Error::SignatureDoesNotMatch)
        ));
    }

    #[tokio::test]
    async fn test_unknown_access_key_rejected() {
        let store = MemoryCredentialStore::from_triples(vec![]);
        let auth = Authenticator::new(Arc::new(store), "repligate");
        let headers = signed_headers("clientsecret");
        assert!(matches!(
            auth.authenticate(&Method::GET, "/bucket/key", None, &headers).await,
            Err(Error::AccessDenied)
        ));
    }

    #[tokio::test]
    async fn test_anonymous_passes_through() {
        let auth = authenticator();
        let access = auth
            .authenticate(&Method::GET, "/bucket/key", None, &HeaderMap::new())
            .await
            .unwrap();
        assert!(access.is_none());
    }
}

//! Multipart upload routing
//!
//! S3 multipart uploads are stateful on the backend, so the whole upload
//! must land on a single replica. The replica is pinned by consistent
//! hash of the object path over the shard's non-maintenance backends:
//! initiate, every part and the completion all hash to the same place
//! without the proxy keeping upload state.

use crate::backend::BackendClient;
use crate::request::ProxyRequest;
use crate::response::BackendResponse;
use http::Method;
use repligate_common::{Error, Result};
use repligate_ring::HashRing;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Multipart substate, detected from the query string
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MultipartKind {
    /// `?uploads`
    Initiate,
    /// `?uploadId=...` part upload / part listing / abort
    Part,
    /// `POST ?uploadId=...` without a part number
    Complete,
}

/// Classify a request as multipart, if it is one
#[must_use]
pub fn multipart_kind(req: &ProxyRequest) -> Option<MultipartKind> {
    if req.has_query_param("uploads") {
        return Some(MultipartKind::Initiate);
    }
    if req.has_query_param("uploadId") {
        if !req.has_query_param("partNumber") && req.method == Method::POST {
            return Some(MultipartKind::Complete);
        }
        return Some(MultipartKind::Part);
    }
    None
}

/// Result body of a completed multipart upload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompleteMultipartUploadResult {
    pub location: Option<String>,
    pub bucket: Option<String>,
    pub key: Option<String>,
    #[serde(rename = "ETag")]
    pub e_tag: Option<String>,
}

/// Routes multipart requests to their pinned replica
pub struct MultipartRouter {
    ring: HashRing,
    backends: HashMap<String, Arc<BackendClient>>,
}

impl MultipartRouter {
    /// Build from a shard's replica set; maintenance backends are not
    /// eligible upload targets
    pub fn new(backends: &[Arc<BackendClient>]) -> Self {
        let active: Vec<&str> = backends
            .iter()
            .filter(|b| !b.maintenance())
            .map(|b| b.endpoint())
            .collect();
        let ring = HashRing::new(&active);
        let backends = backends
            .iter()
            .filter(|b| !b.maintenance())
            .map(|b| (b.endpoint().to_string(), Arc::clone(b)))
            .collect();
        Self { ring, backends }
    }

    /// The pinned backend for an object path
    pub fn pick(&self, path: &str) -> Result<&Arc<BackendClient>> {
        let endpoint = self
            .ring
            .pick(path)
            .map_err(|_| Error::ImpossibleMultipart)?;
        self.backends.get(endpoint).ok_or(Error::ImpossibleMultipart)
    }

    /// Forward a multipart request to its pinned backend. On a successful
    /// completion the body is parsed and the request context flagged so
    /// the consistency gate shifts the record's deadline instead of
    /// deleting it.
    pub async fn route(&self, kind: MultipartKind, req: &ProxyRequest) -> Result<BackendResponse> {
        let backend = self.pick(&req.path)?;
        tracing::debug!(
            request_id = %req.context.request_id,
            backend = %backend.name(),
            ?kind,
            path = %req.path,
            "multipart request pinned"
        );

        let mut response = backend.round_trip(req).await?;

        if kind == MultipartKind::Complete && response.status == http::StatusCode::OK {
            let body = response.buffer_body().await?;
            match quick_xml::de::from_reader::<_, CompleteMultipartUploadResult>(body.as_ref()) {
                Ok(result) => {
                    tracing::debug!(
                        request_id = %req.context.request_id,
                        location = result.location.as_deref().unwrap_or(""),
                        "multipart upload completed"
                    );
                    req.context.set_multipart_complete();
                }
                Err(error) => {
                    tracing::debug!(
                        request_id = %req.context.request_id,
                        %error,
                        "complete-multipart response body did not parse"
                    );
                }
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestContext;
    use bytes::Bytes;
    use http::HeaderMap;
    use repligate_common::ConsistencyLevel;

    fn request(method: Method, query: Option<&str>) -> ProxyRequest {
        ProxyRequest::new(
            method,
            "/bucket/key",
            query.map(|q| q.to_string()),
            HeaderMap::new(),
            Bytes::new(),
            Arc::new(RequestContext::new("d", None, ConsistencyLevel::Weak, false)),
        )
    }

    #[test]
    fn test_multipart_kind_detection() {
        assert_eq!(
            multipart_kind(&request(Method::POST, Some("uploads"))),
            Some(MultipartKind::Initiate)
        );
        assert_eq!(
            multipart_kind(&request(Method::PUT, Some("uploadId=42&partNumber=1"))),
            Some(MultipartKind::Part)
        );
        assert_eq!(
            multipart_kind(&request(Method::POST, Some("uploadId=42"))),
            Some(MultipartKind::Complete)
        );
        // Listing parts is pinned but is not a completion
        assert_eq!(
            multipart_kind(&request(Method::GET, Some("uploadId=42"))),
            Some(MultipartKind::Part)
        );
        assert_eq!(multipart_kind(&request(Method::PUT, None)), None);
        assert_eq!(multipart_kind(&request(Method::GET, Some("acl"))), None);
    }

    #[test]
    fn test_complete_result_parses() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Location>http://backend/bucket/key</Location>
  <Bucket>bucket</Bucket>
  <Key>key</Key>
  <ETag>"3858f62230ac3c915f300c664312c11f-2"</ETag>
</CompleteMultipartUploadResult>"#;
        let result: CompleteMultipartUploadResult = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(result.bucket.as_deref(), Some("bucket"));
        assert_eq!(result.key.as_deref(), Some("key"));

        assert!(quick_xml::de::from_str::<CompleteMultipartUploadResult>("not xml").is_err());
    }
}

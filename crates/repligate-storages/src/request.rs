//! Replayable proxy request and its per-request context

use crate::NO_REGRESSION_HEADER;
use bytes::Bytes;
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use repligate_common::{is_bucket_path, ConsistencyLevel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A client request, buffered so it can be replayed against several
/// replicas and regression shards.
#[derive(Clone, Debug)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path as received, including the leading slash
    pub path: String,
    /// Raw query string, without the `?`
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub context: Arc<RequestContext>,
}

impl ProxyRequest {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
        context: Arc<RequestContext>,
    ) -> Self {
        Self { method, path: path.into(), query, headers, body, context }
    }

    /// Whether the path addresses a bucket (one non-empty segment)
    #[must_use]
    pub fn is_bucket_scoped(&self) -> bool {
        is_bucket_path(&self.path)
    }

    /// Whether the query string carries `name` (with or without a value)
    #[must_use]
    pub fn has_query_param(&self, name: &str) -> bool {
        self.query_param(name).is_some()
    }

    /// First value of query parameter `name`; `Some("")` for bare flags
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let query = self.query.as_deref()?;
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            if parts.next() == Some(name) {
                return Some(parts.next().unwrap_or(""));
            }
        }
        None
    }

    /// Whether the client suppressed timeout-triggered regression
    #[must_use]
    pub fn suppresses_regression(&self) -> bool {
        self.headers.contains_key(NO_REGRESSION_HEADER)
    }
}

/// Mutable per-request state shared between the gate, the dispatcher and
/// the multipart router.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    /// Host-header domain the request arrived on
    pub domain: String,
    /// Access key from the Authorization header, if any
    pub access_key: Option<String>,
    pub consistency_level: ConsistencyLevel,
    pub read_repair: bool,
    /// Version lifted from a regression GET, for read-repair
    read_repair_version: Mutex<Option<i64>>,
    /// Set when a complete-multipart response parsed successfully
    multipart_complete: AtomicBool,
    /// AND of per-dispatch "all replicas 2xx/3xx" results
    no_errors: AtomicBool,
    dispatched: AtomicBool,
}

impl RequestContext {
    pub fn new(
        domain: impl Into<String>,
        access_key: Option<String>,
        consistency_level: ConsistencyLevel,
        read_repair: bool,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            domain: domain.into(),
            access_key,
            consistency_level,
            read_repair,
            read_repair_version: Mutex::new(None),
            multipart_complete: AtomicBool::new(false),
            no_errors: AtomicBool::new(true),
            dispatched: AtomicBool::new(false),
        }
    }

    pub fn set_read_repair_version(&self, version: i64) {
        *self.read_repair_version.lock() = Some(version);
    }

    #[must_use]
    pub fn read_repair_version(&self) -> Option<i64> {
        *self.read_repair_version.lock()
    }

    pub fn set_multipart_complete(&self) {
        self.multipart_complete.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn multipart_complete(&self) -> bool {
        self.multipart_complete.load(Ordering::SeqCst)
    }

    /// Fold one dispatch outcome into the request-wide success flag
    pub fn record_dispatch(&self, all_replicas_ok: bool) {
        self.dispatched.store(true, Ordering::SeqCst);
        if !all_replicas_ok {
            self.no_errors.store(false, Ordering::SeqCst);
        }
    }

    /// True iff at least one dispatch ran and none reported a failure
    #[must_use]
    pub fn no_errors(&self) -> bool {
        self.dispatched.load(Ordering::SeqCst) && self.no_errors.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, query: Option<&str>) -> ProxyRequest {
        ProxyRequest::new(
            Method::GET,
            path,
            query.map(|q| q.to_string()),
            HeaderMap::new(),
            Bytes::new(),
            Arc::new(RequestContext::new("s3.example.com", None, ConsistencyLevel::Weak, false)),
        )
    }

    #[test]
    fn test_query_params() {
        let req = request("/b/o", Some("uploads"));
        assert!(req.has_query_param("uploads"));
        assert_eq!(req.query_param("uploads"), Some(""));
        assert!(!req.has_query_param("uploadId"));

        let req = request("/b/o", Some("uploadId=abc&partNumber=2"));
        assert_eq!(req.query_param("uploadId"), Some("abc"));
        assert_eq!(req.query_param("partNumber"), Some("2"));
    }

    #[test]
    fn test_bucket_scope() {
        assert!(request("/bucket", None).is_bucket_scoped());
        assert!(!request("/bucket/key", None).is_bucket_scoped());
    }

    #[test]
    fn test_no_errors_requires_dispatch() {
        let ctx = RequestContext::new("d", None, ConsistencyLevel::Weak, false);
        assert!(!ctx.no_errors());
        ctx.record_dispatch(true);
        assert!(ctx.no_errors());
        ctx.record_dispatch(false);
        assert!(!ctx.no_errors());
        ctx.record_dispatch(true);
        assert!(!ctx.no_errors());
    }
}

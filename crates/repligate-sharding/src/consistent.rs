//! Consistency gate
//!
//! Wraps the shards ring with write-ahead bookkeeping. The record is
//! inserted before the fan-out (write-ahead), deleted only when every
//! replica confirmed the write, kept for the reconciler otherwise.
//! Multipart uploads get one record at initiate; its deadline is shifted
//! when the upload completes. Read-repair turns a version lifted from a
//! regression GET into a synthetic PUT record.

use crate::ring::ShardsRing;
use chrono::Duration;
use http::{HeaderValue, Method as HttpMethod};
use repligate_common::{ConsistencyLevel, Error, Method, ObjectRef, Result};
use repligate_storages::{
    multipart_kind, BackendResponse, MultipartKind, ProxyRequest, RequestContext,
};
use repligate_watchdog::{ConsistencyLog, ConsistencyRecord, DeleteMarker, ExecutionDelay};
use std::sync::Arc;

/// What the admission check decided to record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Admission {
    method: Method,
    /// Multipart initiate: the record outlives a successful response
    initiate: bool,
}

/// The consistency gate around one region's ring
pub struct ConsistentRing {
    ring: Arc<ShardsRing>,
    log: Arc<dyn ConsistencyLog>,
    record_delay: Duration,
    multipart_delta: Duration,
}

impl ConsistentRing {
    pub fn new(
        ring: Arc<ShardsRing>,
        log: Arc<dyn ConsistencyLog>,
        record_delay: Duration,
        multipart_delta: Duration,
    ) -> Self {
        Self { ring, log, record_delay, multipart_delta }
    }

    /// The routing ring underneath (shared with the reconciler)
    #[must_use]
    pub fn shards_ring(&self) -> &Arc<ShardsRing> {
        &self.ring
    }

    /// The region's consistency properties
    #[must_use]
    pub fn props(&self) -> crate::ring::RingProps {
        self.ring.props()
    }

    /// Run one request through record insertion, dispatch and completion
    /// bookkeeping.
    ///
    /// Dropping this future (client disconnect) cancels the in-flight
    /// replica round-trips; the completion bookkeeping is armed before
    /// the dispatch and detaches itself in that case, so it runs either
    /// way.
    pub async fn handle(&self, req: &mut ProxyRequest) -> Result<BackendResponse> {
        let admission = Self::admission(req);

        let mut marker: Option<DeleteMarker> = None;
        let mut is_initiate = false;

        if let Some(admission) = admission {
            is_initiate = admission.initiate;
            match self.insert_record(req, admission).await {
                Ok(inserted) => marker = Some(inserted),
                Err(error) => {
                    if req.context.consistency_level == ConsistencyLevel::Strong {
                        tracing::error!(
                            request_id = %req.context.request_id,
                            %error,
                            "consistency record insert failed under strong consistency"
                        );
                        return Err(error);
                    }
                    tracing::warn!(
                        request_id = %req.context.request_id,
                        %error,
                        "consistency record insert failed, proceeding under weak consistency"
                    );
                }
            }
        }

        let mut guard = CompletionGuard(Some(Completion {
            log: Arc::clone(&self.log),
            method: req.method.clone(),
            path: req.path.clone(),
            context: Arc::clone(&req.context),
            marker,
            is_initiate,
            record_delay: self.record_delay,
            multipart_delta: self.multipart_delta,
        }));

        let result = self.ring.do_request(req).await;

        if let Some(completion) = guard.0.take() {
            completion.run().await;
        }
        result
    }

    /// Which requests get a consistency record: object-scoped PUTs and
    /// DELETEs (ACL PUTs included) and multipart initiations, under weak
    /// or strong consistency. GETs, bucket paths, part uploads and level
    /// `none` never insert.
    fn admission(req: &ProxyRequest) -> Option<Admission> {
        if req.context.consistency_level == ConsistencyLevel::None {
            return None;
        }
        if req.is_bucket_scoped() || ObjectRef::from_path(&req.path).is_err() {
            return None;
        }
        match multipart_kind(req) {
            Some(MultipartKind::Initiate) => {
                return Some(Admission { method: Method::Put, initiate: true })
            }
            Some(_) => return None,
            None => {}
        }
        if req.method == HttpMethod::PUT {
            Some(Admission { method: Method::Put, initiate: false })
        } else if req.method == HttpMethod::DELETE {
            Some(Admission { method: Method::Delete, initiate: false })
        } else {
            None
        }
    }

    /// Build, version and persist the record; stamp the version into the
    /// outgoing write so replicas store it in object metadata.
    async fn insert_record(
        &self,
        req: &mut ProxyRequest,
        admission: Admission,
    ) -> Result<DeleteMarker> {
        let object = ObjectRef::from_path(&req.path)?;
        let access_key = req
            .context
            .access_key
            .clone()
            .ok_or_else(|| Error::MalformedRecord("no access key on request".into()))?;

        let mut record = ConsistencyRecord::new(
            object.object_id(),
            req.context.domain.clone(),
            admission.method,
            access_key,
            req.context.request_id.clone(),
            self.record_delay,
        );

        self.log
            .supply_record_with_version(&mut record)
            .await
            .map_err(|e| Error::ConsistencyLog(e.to_string()))?;

        if admission.method == Method::Put {
            let value = HeaderValue::from_str(&record.object_version.to_string())
                .map_err(|_| Error::internal("version header value"))?;
            req.headers.insert(
                http::header::HeaderName::try_from(self.ring.version_header())
                    .map_err(|_| Error::Configuration("bad version header name".into()))?,
                value,
            );
        }

        let marker = self
            .log
            .insert(&record)
            .await
            .map_err(|e| Error::ConsistencyLog(e.to_string()))?;

        tracing::debug!(
            request_id = %req.context.request_id,
            object_id = %record.object_id,
            version = record.object_version,
            method = %record.method,
            "consistency record inserted"
        );
        Ok(marker)
    }

}

/// Completion bookkeeping, detached from the request future.
///
/// Owns everything it needs, so it can run on the request task after a
/// normal dispatch or on a task of its own when the client hung up
/// mid-request.
struct Completion {
    log: Arc<dyn ConsistencyLog>,
    method: HttpMethod,
    path: String,
    context: Arc<RequestContext>,
    marker: Option<DeleteMarker>,
    is_initiate: bool,
    record_delay: Duration,
    multipart_delta: Duration,
}

/// Spawns the completion if the request future is dropped before it ran
struct CompletionGuard(Option<Completion>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(completion) = self.0.take() {
            tokio::spawn(completion.run());
        }
    }
}

impl Completion {
    /// Runs after every dispatch, successful, failed or cancelled
    async fn run(self) {
        let ctx = &self.context;

        // A completed multipart upload shifts the initiate record's
        // deadline instead of deleting it
        if ctx.multipart_complete() {
            if let Ok(object) = ObjectRef::from_path(&self.path) {
                let delay = ExecutionDelay {
                    object_id: object.object_id(),
                    domain: ctx.domain.clone(),
                    delta: self.multipart_delta,
                };
                if let Err(error) = self.log.update_execution_delay(&delay).await {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        %error,
                        "failed to shift multipart record deadline"
                    );
                }
            }
        }

        if let Some(marker) = &self.marker {
            let keep = self.is_initiate || ctx.multipart_complete() || !ctx.no_errors();
            if keep {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    object_id = marker.object_id(),
                    "record kept for the reconciler"
                );
            } else if let Err(error) = self.log.delete(marker).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    %error,
                    "failed to compact consistency record"
                );
            }
        }

        // Read-repair: propagate the version a regression GET served
        if self.method == HttpMethod::GET && ctx.read_repair {
            if let Some(version) = ctx.read_repair_version() {
                self.insert_read_repair(version).await;
            }
        }
    }

    async fn insert_read_repair(&self, version: i64) {
        let ctx = &self.context;
        let object = match ObjectRef::from_path(&self.path) {
            Ok(object) => object,
            Err(_) => return,
        };
        let Some(access_key) = ctx.access_key.clone() else {
            tracing::debug!(
                request_id = %ctx.request_id,
                "skipping read-repair for anonymous request"
            );
            return;
        };

        let record = ConsistencyRecord::new(
            object.object_id(),
            ctx.domain.clone(),
            Method::Put,
            access_key,
            ctx.request_id.clone(),
            self.record_delay,
        )
        .read_repair_copy(version);

        match self.log.insert(&record).await {
            Ok(_) => tracing::debug!(
                request_id = %ctx.request_id,
                object_id = %record.object_id,
                version,
                "read-repair record inserted"
            ),
            Err(error) => tracing::warn!(
                request_id = %ctx.request_id,
                %error,
                "failed to insert read-repair record"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use repligate_storages::RequestContext;
    use repligate_watchdog::testing::MemoryConsistencyLog;

    fn gate_over(
        ring: ShardsRing,
        log: Arc<MemoryConsistencyLog>,
    ) -> ConsistentRing {
        ConsistentRing::new(
            Arc::new(ring),
            log,
            Duration::seconds(300),
            Duration::seconds(-3600),
        )
    }

    fn request_with(
        method: HttpMethod,
        path: &str,
        query: Option<&str>,
        level: ConsistencyLevel,
        read_repair: bool,
    ) -> ProxyRequest {
        ProxyRequest::new(
            method,
            path,
            query.map(|q| q.to_string()),
            HeaderMap::new(),
            Bytes::new(),
            Arc::new(RequestContext::new(
                "s3.example.com",
                Some("AKIDCLIENT".into()),
                level,
                read_repair,
            )),
        )
    }

    #[tokio::test]
    async fn test_record_insertion_matrix() {
        for (method, path, query, level, should_insert) in [
            (HttpMethod::PUT, "/newbucket", None, ConsistencyLevel::Strong, false),
            (HttpMethod::PUT, "/newbucket", None, ConsistencyLevel::Weak, false),
            (HttpMethod::PUT, "/newbucket", None, ConsistencyLevel::None, false),
            (HttpMethod::PUT, "/newbucket/object", None, ConsistencyLevel::Strong, true),
            (HttpMethod::PUT, "/newbucket/object", None, ConsistencyLevel::Weak, true),
            (HttpMethod::PUT, "/newbucket/object", None, ConsistencyLevel::None, false),
            (HttpMethod::GET, "/newbucket/object", None, ConsistencyLevel::Strong, false),
            (HttpMethod::GET, "/newbucket/object", Some("acl"), ConsistencyLevel::Strong, false),
            (HttpMethod::PUT, "/newbucket/object", Some("acl"), ConsistencyLevel::Strong, true),
            (HttpMethod::DELETE, "/newbucket/object", None, ConsistencyLevel::Weak, true),
            // Part uploads ride on the initiate record
            (
                HttpMethod::PUT,
                "/newbucket/object",
                Some("uploadId=42&partNumber=1"),
                ConsistencyLevel::Strong,
                false,
            ),
        ] {
            let (ep, _) = spawn_backend(StatusCode::OK, vec![]).await;
            let log = Arc::new(MemoryConsistencyLog::new());
            let gate = gate_over(
                ring_over(vec![shard_of("alpha", &[&ep])], "x-amz-meta-object-version"),
                Arc::clone(&log),
            );

            let mut req = request_with(method.clone(), path, query, level, false);
            gate.handle(&mut req).await.unwrap();

            assert_eq!(
                log.insert_count() > 0,
                should_insert,
                "method={method} path={path} query={query:?} level={level:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_strong_insert_failure_aborts_before_dispatch() {
        let (ep, hits) = spawn_backend(StatusCode::OK, vec![]).await;
        let log = Arc::new(MemoryConsistencyLog::new());
        log.fail_inserts(true);
        let gate = gate_over(
            ring_over(vec![shard_of("alpha", &[&ep])], "x-amz-meta-object-version"),
            Arc::clone(&log),
        );

        let mut req =
            request_with(HttpMethod::PUT, "/b/o", None, ConsistencyLevel::Strong, false);
        let result = gate.handle(&mut req).await;

        assert!(matches!(result, Err(Error::ConsistencyLog(_))));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_weak_insert_failure_proceeds() {
        let (ep, hits) = spawn_backend(StatusCode::OK, vec![]).await;
        let log = Arc::new(MemoryConsistencyLog::new());
        log.fail_inserts(true);
        let gate = gate_over(
            ring_over(vec![shard_of("alpha", &[&ep])], "x-amz-meta-object-version"),
            Arc::clone(&log),
        );

        let mut req = request_with(HttpMethod::PUT, "/b/o", None, ConsistencyLevel::Weak, false);
        let response = gate.handle(&mut req).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_record_compacted_on_full_success() {
        let (ep, _) = spawn_backend(StatusCode::OK, vec![]).await;
        let log = Arc::new(MemoryConsistencyLog::new());
        let gate = gate_over(
            ring_over(vec![shard_of("alpha", &[&ep])], "x-amz-meta-object-version"),
            Arc::clone(&log),
        );

        let mut req = request_with(HttpMethod::PUT, "/b/o", None, ConsistencyLevel::Weak, false);
        gate.handle(&mut req).await.unwrap();

        assert_eq!(log.insert_count(), 1);
        assert!(log.is_empty(), "record must be deleted after full success");
    }

    #[tokio::test]
    async fn test_record_kept_on_replica_failure() {
        let (ok_ep, _) = spawn_backend(StatusCode::OK, vec![]).await;
        let (bad_ep, _) = spawn_backend(StatusCode::INTERNAL_SERVER_ERROR, vec![]).await;
        let log = Arc::new(MemoryConsistencyLog::new());
        let gate = gate_over(
            ring_over(vec![shard_of("alpha", &[&ok_ep, &bad_ep])], "x-amz-meta-object-version"),
            Arc::clone(&log),
        );

        let mut req = request_with(HttpMethod::PUT, "/b/o", None, ConsistencyLevel::Weak, false);
        let response = gate.handle(&mut req).await.unwrap();

        // Client still gets the healthy replica's response
        assert_eq!(response.status, StatusCode::OK);
        let records = log.records();
        assert_eq!(records.len(), 1, "record must stay for the reconciler");
        assert_eq!(records[0].object_id, "b/o");
        assert!(records[0].object_version > 0);
    }

    #[tokio::test]
    async fn test_version_header_stamped_on_puts() {
        // The backend echoes nothing; we inspect the request headers via
        // the record version instead: stamped header == record version
        let (ep, _) = spawn_backend(StatusCode::OK, vec![]).await;
        let log = Arc::new(MemoryConsistencyLog::new());
        let gate = gate_over(
            ring_over(vec![shard_of("alpha", &[&ep])], "x-amz-meta-object-version"),
            Arc::clone(&log),
        );

        let mut req =
            request_with(HttpMethod::PUT, "/b/o", None, ConsistencyLevel::Strong, false);
        gate.handle(&mut req).await.unwrap();

        let stamped: i64 = req.headers["x-amz-meta-object-version"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(stamped, 1);
    }

    #[tokio::test]
    async fn test_read_repair_inserts_synthetic_record() {
        // Region with two shards; the picked one 404s, the fallback
        // serves version 7
        let (bad_ep, _) = spawn_backend(StatusCode::NOT_FOUND, vec![]).await;
        let (good_ep, _) =
            spawn_backend(StatusCode::OK, vec![("x-amz-meta-object-version", "7".into())]).await;

        let probe = ring_over(
            vec![shard_of("alpha", &[]), shard_of("beta", &[])],
            "x-amz-meta-object-version",
        );
        let (picked, _) = probe.pick("/bucket/object").unwrap();
        let (origin, fallback) =
            if picked == "alpha" { ("alpha", "beta") } else { ("beta", "alpha") };

        let log = Arc::new(MemoryConsistencyLog::new());
        let gate = gate_over(
            ring_over(
                vec![shard_of(origin, &[&bad_ep]), shard_of(fallback, &[&good_ep])],
                "x-amz-meta-object-version",
            ),
            Arc::clone(&log),
        );

        let mut req =
            request_with(HttpMethod::GET, "/bucket/object", None, ConsistencyLevel::Weak, true);
        let response = gate.handle(&mut req).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, Method::Put);
        assert_eq!(records[0].object_version, 7);
        assert_eq!(records[0].object_id, "bucket/object");
    }

    #[tokio::test]
    async fn test_initiate_record_survives_success() {
        let (ep, _) = spawn_backend(StatusCode::OK, vec![]).await;
        let log = Arc::new(MemoryConsistencyLog::new());
        let gate = gate_over(
            ring_over(vec![shard_of("alpha", &[&ep])], "x-amz-meta-object-version"),
            Arc::clone(&log),
        );

        let mut req = request_with(
            HttpMethod::POST,
            "/b/o",
            Some("uploads"),
            ConsistencyLevel::Strong,
            false,
        );
        gate.handle(&mut req).await.unwrap();

        let records = log.records();
        assert_eq!(records.len(), 1, "initiate record must not be compacted");
        assert_eq!(records[0].method, Method::Put);
    }

    #[tokio::test]
    async fn test_multipart_complete_shifts_deadline() {
        // The backend answers every request with the completion XML;
        // only the complete POST parses it
        let xml = r#"<CompleteMultipartUploadResult><Bucket>b</Bucket><Key>o</Key></CompleteMultipartUploadResult>"#;
        let (complete_ep, _) = spawn_backend_with_body(StatusCode::OK, vec![], xml).await;

        let log = Arc::new(MemoryConsistencyLog::new());
        let gate = gate_over(
            ring_over(vec![shard_of("alpha", &[&complete_ep])], "x-amz-meta-object-version"),
            Arc::clone(&log),
        );

        // Initiate inserts the record
        let mut initiate = request_with(
            HttpMethod::POST,
            "/b/o",
            Some("uploads"),
            ConsistencyLevel::Strong,
            false,
        );
        gate.handle(&mut initiate).await.unwrap();
        let before = log.records()[0].execution_date;

        // Complete shifts its deadline by the (negative) delta
        let mut complete = request_with(
            HttpMethod::POST,
            "/b/o",
            Some("uploadId=42"),
            ConsistencyLevel::Strong,
            false,
        );
        gate.handle(&mut complete).await.unwrap();

        let records = log.records();
        assert_eq!(records.len(), 1, "record is shifted, not deleted");
        assert_eq!(records[0].execution_date, before + Duration::seconds(-3600));
    }

    #[tokio::test]
    async fn test_cancelled_request_still_runs_bookkeeping() {
        // A replica that answers far too late, so the request future is
        // dropped mid-dispatch like on a client disconnect
        let app = axum::Router::new().fallback(|| async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            StatusCode::OK
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let slow_ep = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let log = Arc::new(MemoryConsistencyLog::new());
        let gate = gate_over(
            ring_over(vec![shard_of("alpha", &[&slow_ep])], "x-amz-meta-object-version"),
            Arc::clone(&log),
        );

        let mut req =
            request_with(HttpMethod::PUT, "/b/o", None, ConsistencyLevel::Strong, false);
        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            gate.handle(&mut req),
        )
        .await;
        assert!(cancelled.is_err(), "dispatch must still be pending when dropped");

        // The detached bookkeeping keeps the record: the write never
        // confirmed on the replicas, so the reconciler owns it now
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(log.insert_count(), 1);
        let records = log.records();
        assert_eq!(records.len(), 1, "record must survive the cancelled request");
        assert_eq!(records[0].object_id, "b/o");
    }
}

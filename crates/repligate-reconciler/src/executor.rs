//! Migration executor
//!
//! Runs one task: copies the object body (with its metadata headers and
//! the recorded version) from the source replica onto each destination,
//! or deletes it from each destination. Transfers within a task run with
//! bounded concurrency; the task's hook fires after the last transfer.

use crate::hook::RecordHook;
use crate::task::{MigrationAuth, WalTask};
use bytes::Bytes;
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use repligate_auth::sigv2;
use repligate_common::{Error, Method, ObjectRef, Result};

/// Executes migration and cleanup tasks
pub struct MigrationExecutor {
    client: reqwest::Client,
    version_header: String,
    concurrency: usize,
}

/// Object body plus the metadata headers worth carrying across replicas
struct FetchedObject {
    body: Bytes,
    content_type: Option<String>,
    metadata: Vec<(String, String)>,
}

impl MigrationExecutor {
    pub fn new(
        client: reqwest::Client,
        version_header: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self { client, version_header: version_header.into(), concurrency: concurrency.max(1) }
    }

    /// Run the task and fire its hook
    pub async fn execute(&self, task: WalTask) {
        if task.is_droppable() {
            return;
        }
        let result = self.run(&task).await;
        if let Err(error) = &result {
            tracing::warn!(
                object_id = %task.record.object_id,
                version = task.record.object_version,
                %error,
                "migration task failed"
            );
        }
        if let Some(hook) = task.hook {
            hook.complete(result).await;
        }
    }

    /// Run the task's transfers without touching its hook; the pipeline
    /// uses this to chain an entry's tasks and fire the hook once
    pub async fn run(&self, task: &WalTask) -> Result<()> {
        if task.destinations.is_empty() {
            return Ok(());
        }
        let object = ObjectRef::from_object_id(&task.record.object_id)
            .map_err(|e| Error::MalformedRecord(e.to_string()))?;

        match task.record.method {
            Method::Put => {
                let source = task
                    .source
                    .as_ref()
                    .ok_or_else(|| Error::internal("PUT task without a source"))?;
                let fetched = self.fetch_object(source, &object).await?;

                let futures: Vec<_> = task
                    .destinations
                    .iter()
                    .map(|destination| {
                        self.put_object(destination, &object, &fetched, task.record.object_version)
                            .boxed()
                    })
                    .collect();
                let failures: Vec<Error> = stream::iter(futures)
                    .buffer_unordered(self.concurrency)
                    .filter_map(|result| async move { result.err() })
                    .collect()
                    .await;

                match failures.into_iter().next() {
                    None => Ok(()),
                    Some(first) => Err(first),
                }
            }
            Method::Delete => {
                let futures: Vec<_> = task
                    .destinations
                    .iter()
                    .map(|destination| self.delete_object(destination, &object).boxed())
                    .collect();
                let failures: Vec<Error> = stream::iter(futures)
                    .buffer_unordered(self.concurrency)
                    .filter_map(|result| async move { result.err() })
                    .collect()
                    .await;

                match failures.into_iter().next() {
                    None => Ok(()),
                    Some(first) => Err(first),
                }
            }
        }
    }

    async fn fetch_object(
        &self,
        source: &MigrationAuth,
        object: &ObjectRef,
    ) -> Result<FetchedObject> {
        let response = self
            .send(reqwest::Method::GET, source, object, None, &[])
            .await?;
        if response.status().as_u16() != 200 {
            return Err(Error::Transport(format!(
                "source {} returned {} for {}",
                source.endpoint,
                response.status(),
                object
            )));
        }

        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let metadata: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| name.as_str().starts_with("x-amz-meta-"))
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(FetchedObject { body, content_type, metadata })
    }

    async fn put_object(
        &self,
        destination: &MigrationAuth,
        object: &ObjectRef,
        fetched: &FetchedObject,
        version: i64,
    ) -> Result<()> {
        let mut extra: Vec<(String, String)> = fetched.metadata.clone();
        // The stamped version makes the copy indistinguishable from the
        // original write for later surveys
        extra.retain(|(name, _)| *name != self.version_header);
        extra.push((self.version_header.clone(), version.to_string()));
        if let Some(content_type) = &fetched.content_type {
            extra.push(("content-type".to_string(), content_type.clone()));
        }

        let response = self
            .send(
                reqwest::Method::PUT,
                destination,
                object,
                Some(fetched.body.clone()),
                &extra,
            )
            .await?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "destination {} returned {} for {}",
                destination.endpoint,
                response.status(),
                object
            )));
        }
        tracing::debug!(
            endpoint = %destination.endpoint,
            object_id = %object,
            version,
            "object copied"
        );
        Ok(())
    }

    async fn delete_object(&self, destination: &MigrationAuth, object: &ObjectRef) -> Result<()> {
        let response = self
            .send(reqwest::Method::DELETE, destination, object, None, &[])
            .await?;
        // 404 means someone else already finished the delete
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(Error::Transport(format!(
                "delete on {} returned {} for {}",
                destination.endpoint,
                response.status(),
                object
            )));
        }
        tracing::debug!(endpoint = %destination.endpoint, object_id = %object, "object cleared");
        Ok(())
    }

    async fn send(
        &self,
        method: reqwest::Method,
        auth: &MigrationAuth,
        object: &ObjectRef,
        body: Option<Bytes>,
        extra_headers: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let path = format!("/{}/{}", object.bucket(), object.key());
        let url = format!("{}{}", auth.endpoint.trim_end_matches('/'), path);
        let host = crate::fetcher::host_of(&auth.endpoint)?;

        let mut headers = http::HeaderMap::new();
        for (name, value) in extra_headers {
            let name = http::header::HeaderName::try_from(name.as_str())
                .map_err(|_| Error::internal(format!("bad header name {name}")))?;
            let value = http::HeaderValue::from_str(value)
                .map_err(|_| Error::internal("bad header value"))?;
            headers.insert(name, value);
        }
        sigv2::sign_v2(
            &method,
            &path,
            None,
            &mut headers,
            &host,
            &auth.keys.access,
            &auth.keys.secret,
        )
        .map_err(|e| Error::internal(format!("signing failed: {e}")))?;

        let mut request = self.client.request(method, &url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        request
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_replica, ReplicaStore, VERSION_HEADER};
    use chrono::Duration;
    use repligate_common::Keys;
    use repligate_watchdog::testing::MemoryConsistencyLog;
    use repligate_watchdog::{ConsistencyLog, ConsistencyRecord};
    use std::sync::Arc;

    fn auth(endpoint: &str) -> MigrationAuth {
        MigrationAuth {
            endpoint: endpoint.to_string(),
            keys: Keys { access: "AK".into(), secret: "S".into() },
        }
    }

    fn record(method: Method, version: i64) -> ConsistencyRecord {
        let mut record = ConsistencyRecord::new(
            "bucket/object",
            "s3.example.com",
            method,
            "AKIDCLIENT",
            "req-1",
            Duration::seconds(0),
        );
        record.object_version = version;
        record
    }

    fn executor() -> MigrationExecutor {
        MigrationExecutor::new(reqwest::Client::new(), VERSION_HEADER, 2)
    }

    #[tokio::test]
    async fn test_copy_stamps_version_on_destination() {
        let src_store = ReplicaStore::default();
        src_store.put("/bucket/object", b"payload", Some("7"));
        let src = spawn_replica(src_store).await;

        let dst_store = ReplicaStore::default();
        let dst = spawn_replica(dst_store.clone()).await;

        let log = Arc::new(MemoryConsistencyLog::new());
        let rec = record(Method::Put, 7);
        let marker = log.insert(&rec).await.unwrap();

        let task = WalTask {
            record: rec,
            source: Some(auth(&src)),
            destinations: vec![auth(&dst)],
            hook: Some(RecordHook::new(Arc::clone(&log) as Arc<dyn ConsistencyLog>, marker, None)),
        };
        executor().execute(task).await;

        let stored = dst_store.get("/bucket/object").unwrap();
        assert_eq!(stored.0, b"payload");
        assert_eq!(stored.1.as_deref(), Some("7"));
        // Hook deleted the record
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_delete_task_clears_destinations() {
        let store_a = ReplicaStore::default();
        store_a.put("/bucket/object", b"old", Some("3"));
        let a = spawn_replica(store_a.clone()).await;

        let store_b = ReplicaStore::default();
        let b = spawn_replica(store_b).await;

        let task = WalTask {
            record: record(Method::Delete, 4),
            source: None,
            destinations: vec![auth(&a), auth(&b)],
            hook: None,
        };
        executor().execute(task).await;

        assert!(store_a.is_empty());
    }

    #[tokio::test]
    async fn test_failed_copy_keeps_record() {
        // Source is up, destination refuses connections
        let src_store = ReplicaStore::default();
        src_store.put("/bucket/object", b"payload", Some("7"));
        let src = spawn_replica(src_store).await;

        let log = Arc::new(MemoryConsistencyLog::new());
        let rec = record(Method::Put, 7);
        let marker = log.insert(&rec).await.unwrap();

        let task = WalTask {
            record: rec,
            source: Some(auth(&src)),
            destinations: vec![auth("http://127.0.0.1:9")],
            hook: Some(RecordHook::new(Arc::clone(&log) as Arc<dyn ConsistencyLog>, marker, None)),
        };
        executor().execute(task).await;

        // Hook fired with a transient error: the record survives so the
        // next scan retries the copy
        assert!(!log.is_empty());
    }

    #[tokio::test]
    async fn test_droppable_task_is_ignored() {
        let task = WalTask {
            record: record(Method::Put, 1),
            source: None,
            destinations: vec![],
            hook: None,
        };
        assert!(task.is_droppable());
        executor().execute(task).await;
    }
}

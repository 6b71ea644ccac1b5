//! Test helpers: a minimal in-memory S3 replica
//!
//! GET serves stored objects (with their version header), PUT stores
//! them capturing the version header, DELETE removes them, HEAD answers
//! like GET without a body.

use axum::extract::State;
use axum::Router;
use http::StatusCode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub const VERSION_HEADER: &str = "x-amz-meta-object-version";

#[derive(Clone, Default)]
pub struct ReplicaStore {
    /// path → (body, version header value)
    pub objects: Arc<Mutex<HashMap<String, (Vec<u8>, Option<String>)>>>,
}

impl ReplicaStore {
    pub fn put(&self, path: &str, body: &[u8], version: Option<&str>) {
        self.objects
            .lock()
            .insert(path.to_string(), (body.to_vec(), version.map(|v| v.to_string())));
    }

    pub fn get(&self, path: &str) -> Option<(Vec<u8>, Option<String>)> {
        self.objects.lock().get(path).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

async fn handler(
    State(store): State<ReplicaStore>,
    req: axum::extract::Request,
) -> axum::response::Response {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let version = req
        .headers()
        .get(VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    let mut objects = store.objects.lock();
    let respond = |status: StatusCode, body: axum::body::Body| {
        axum::response::Response::builder().status(status).body(body).unwrap()
    };

    match method.as_str() {
        "GET" | "HEAD" => match objects.get(&path) {
            Some((data, version)) => {
                let mut builder = axum::response::Response::builder().status(StatusCode::OK);
                if let Some(version) = version {
                    builder = builder.header(VERSION_HEADER, version);
                }
                let body = if method.as_str() == "HEAD" {
                    axum::body::Body::empty()
                } else {
                    axum::body::Body::from(data.clone())
                };
                builder.body(body).unwrap()
            }
            None => respond(StatusCode::NOT_FOUND, axum::body::Body::empty()),
        },
        "PUT" => {
            objects.insert(path, (body.to_vec(), version));
            respond(StatusCode::OK, axum::body::Body::empty())
        }
        "DELETE" => {
            let status = if objects.remove(&path).is_some() {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::NOT_FOUND
            };
            respond(status, axum::body::Body::empty())
        }
        _ => respond(StatusCode::METHOD_NOT_ALLOWED, axum::body::Body::empty()),
    }
}

/// Spawn the replica and return its endpoint
pub async fn spawn_replica(store: ReplicaStore) -> String {
    let app = Router::new().fallback(handler).with_state(store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

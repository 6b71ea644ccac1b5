//! Shared helpers for the routing and gate tests: throwaway HTTP
//! backends with hit counters, shard/ring construction shortcuts.

use crate::ring::{RingProps, ShardsRing};
use axum::Router;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use repligate_common::ConsistencyLevel;
use repligate_storages::{
    BackendAuth, BackendClient, ProxyRequest, RequestContext, ShardClient,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Spawn a backend answering with a fixed status, headers and body,
/// counting hits
pub async fn spawn_backend_with_body(
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: &'static str,
) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);
    let app = Router::new().fallback(move || {
        let hits = Arc::clone(&hits_clone);
        let headers = headers.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            let mut map = HeaderMap::new();
            for (name, value) in &headers {
                map.insert(*name, HeaderValue::from_str(value).unwrap());
            }
            (status, map, body)
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

/// Spawn a backend with an empty-ish body
pub async fn spawn_backend(
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
) -> (String, Arc<AtomicUsize>) {
    spawn_backend_with_body(status, headers, "body").await
}

/// A shard over the given backend endpoints
pub fn shard_of(name: &str, endpoints: &[&str]) -> (String, Arc<ShardClient>) {
    let backends = endpoints
        .iter()
        .map(|ep| {
            Arc::new(
                BackendClient::new(
                    format!("{name}-{ep}"),
                    *ep,
                    false,
                    BackendAuth::Passthrough,
                    reqwest::Client::new(),
                    Duration::from_secs(2),
                )
                .unwrap(),
            )
        })
        .collect();
    (name.to_string(), Arc::new(ShardClient::new(name, backends)))
}

/// An equal-weight ring over the given shards
pub fn ring_over(shards: Vec<(String, Arc<ShardClient>)>, version_header: &str) -> ShardsRing {
    let weighted: Vec<(String, f64)> =
        shards.iter().map(|(name, _)| (name.clone(), 1.0)).collect();
    ShardsRing::new(
        &weighted,
        shards.into_iter().collect(),
        RingProps { consistency_level: ConsistencyLevel::Weak, read_repair: true },
        version_header,
    )
    .unwrap()
}

pub fn get_request(path: &str) -> ProxyRequest {
    request(Method::GET, path, HeaderMap::new())
}

pub fn request(method: Method, path: &str, headers: HeaderMap) -> ProxyRequest {
    ProxyRequest::new(
        method,
        path,
        None,
        headers,
        Bytes::new(),
        Arc::new(RequestContext::new("s3.example.com", None, ConsistencyLevel::Weak, true)),
    )
}

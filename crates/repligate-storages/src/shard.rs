//! Shard client: concurrent fan-out to one replica set

use crate::backend::BackendClient;
use crate::multipart::{multipart_kind, MultipartRouter};
use crate::request::ProxyRequest;
use crate::response::Dispatched;
use futures::future::join_all;
use repligate_common::Error;
use std::sync::Arc;

/// A named replica set dispatching to every active backend at once.
///
/// Multipart requests short-circuit to the pinned replica instead of
/// fanning out.
pub struct ShardClient {
    name: String,
    backends: Vec<Arc<BackendClient>>,
    multipart: MultipartRouter,
}

impl ShardClient {
    pub fn new(name: impl Into<String>, backends: Vec<Arc<BackendClient>>) -> Self {
        let multipart = MultipartRouter::new(&backends);
        Self { name: name.into(), backends, multipart }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All backends of the shard, maintenance ones included
    #[must_use]
    pub fn backends(&self) -> &[Arc<BackendClient>] {
        &self.backends
    }

    /// Dispatch to every non-maintenance replica concurrently and record
    /// the aggregate outcome in the request context.
    pub async fn do_request(&self, req: &ProxyRequest) -> Dispatched {
        if let Some(kind) = multipart_kind(req) {
            let result = self.multipart.route(kind, req).await;
            let dispatched = Dispatched { results: vec![result] };
            req.context.record_dispatch(dispatched.all_ok());
            return dispatched;
        }

        let active: Vec<&Arc<BackendClient>> =
            self.backends.iter().filter(|b| !b.maintenance()).collect();

        if active.is_empty() {
            let dispatched = Dispatched {
                results: vec![Err(Error::internal(format!(
                    "shard {} has no active backends",
                    self.name
                )))],
            };
            req.context.record_dispatch(false);
            return dispatched;
        }

        tracing::debug!(
            request_id = %req.context.request_id,
            shard = %self.name,
            replicas = active.len(),
            "dispatching to shard"
        );

        let results = join_all(active.iter().map(|backend| backend.round_trip(req))).await;
        let dispatched = Dispatched { results };
        req.context.record_dispatch(dispatched.all_ok());
        dispatched
    }
}

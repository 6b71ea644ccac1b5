//! Shards ring: path → shard routing with regression fallback
//!
//! The regression map is a single linked cycle over the region's shards
//! (each shard falls back to its predecessor in config order, the first
//! wrapping to the last). The walker carries the origin shard name, so a
//! request visits each shard at most once and never returns to where it
//! started.

use futures::future::join_all;
use http::Method;
use repligate_common::{ConsistencyLevel, Error, Result};
use repligate_ring::HashRing;
use repligate_storages::{BackendResponse, Dispatched, ProxyRequest, ShardClient};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Consistency properties of a region
#[derive(Clone, Copy, Debug)]
pub struct RingProps {
    pub consistency_level: ConsistencyLevel,
    pub read_repair: bool,
}

/// Routes requests within one region
pub struct ShardsRing {
    ring: HashRing,
    shards: BTreeMap<String, Arc<ShardClient>>,
    regression_map: HashMap<String, String>,
    props: RingProps,
    version_header: String,
}

impl ShardsRing {
    /// Build from (shard name, weight) pairs in config order. The order
    /// fixes the regression cycle; the weights fix the hash ring.
    pub fn new(
        weighted: &[(String, f64)],
        shards: BTreeMap<String, Arc<ShardClient>>,
        props: RingProps,
        version_header: impl Into<String>,
    ) -> Result<Self> {
        for (name, _) in weighted {
            if !shards.contains_key(name) {
                return Err(Error::ShardNotFound(name.clone()));
            }
        }

        let ring = HashRing::with_weights(weighted);

        let mut regression_map = HashMap::with_capacity(weighted.len());
        if let Some((last, _)) = weighted.last() {
            let mut previous = last.clone();
            for (name, _) in weighted {
                regression_map.insert(name.clone(), previous);
                previous = name.clone();
            }
        }

        Ok(Self { ring, shards, regression_map, props, version_header: version_header.into() })
    }

    #[must_use]
    pub fn props(&self) -> RingProps {
        self.props
    }

    #[must_use]
    pub fn version_header(&self) -> &str {
        &self.version_header
    }

    /// All shards of the region
    #[must_use]
    pub fn shards(&self) -> &BTreeMap<String, Arc<ShardClient>> {
        &self.shards
    }

    #[cfg(test)]
    pub(crate) fn regression_map(&self) -> &HashMap<String, String> {
        &self.regression_map
    }

    /// Map an object path to its shard
    pub fn pick(&self, key: &str) -> Result<(&str, &Arc<ShardClient>)> {
        let name = self
            .ring
            .pick(key)
            .map_err(|_| Error::NoShardForKey(key.to_string()))?;
        let shard = self
            .shards
            .get(name)
            .ok_or_else(|| Error::ShardNotFound(name.to_string()))?;
        Ok((name, shard))
    }

    /// Route a request: bucket-scoped paths and DELETEs reach every
    /// shard; object paths reach the picked shard, with regression.
    pub async fn do_request(&self, req: &ProxyRequest) -> Result<BackendResponse> {
        if req.method == Method::DELETE || req.is_bucket_scoped() {
            return self.all_shards_request(req).await;
        }

        let (origin, _) = self.pick(&req.path)?;
        let origin = origin.to_string();
        let mut current = origin.clone();

        // Bounded by the cycle length: the walk stops when the map leads
        // back to the origin.
        loop {
            let shard = &self.shards[&current];
            let dispatched = shard.do_request(req).await;
            let winner = dispatched.into_winner();

            if !should_regress(req, &winner) {
                if let Ok(response) = &winner {
                    self.lift_read_repair_version(req, &current, &origin, response);
                }
                return winner;
            }

            match self.regression_map.get(&current) {
                Some(next) if *next != origin => {
                    tracing::debug!(
                        request_id = %req.context.request_id,
                        from = %current,
                        to = %next,
                        "regressing to fallback shard"
                    );
                    // Dropping the losing response closes its body
                    drop(winner);
                    current = next.clone();
                }
                _ => return winner,
            }
        }
    }

    /// Fan out to every shard of the region and pick one combined winner
    async fn all_shards_request(&self, req: &ProxyRequest) -> Result<BackendResponse> {
        tracing::debug!(
            request_id = %req.context.request_id,
            shards = self.shards.len(),
            "dispatching to all shards"
        );
        let per_shard = join_all(self.shards.values().map(|shard| shard.do_request(req))).await;
        let combined = Dispatched {
            results: per_shard.into_iter().flat_map(|d| d.results).collect(),
        };
        combined.into_winner()
    }

    /// A successful GET served by a regression shard carries the version
    /// the client saw; remember it so the gate can schedule read-repair.
    fn lift_read_repair_version(
        &self,
        req: &ProxyRequest,
        winner_shard: &str,
        origin: &str,
        response: &BackendResponse,
    ) {
        if req.method != Method::GET || winner_shard == origin || !response.is_success() {
            return;
        }
        if let Some(version) = response.header_i64(&self.version_header) {
            tracing::debug!(
                request_id = %req.context.request_id,
                version,
                shard = winner_shard,
                "lifting version for read-repair"
            );
            req.context.set_read_repair_version(version);
        }
    }
}

/// Regression is walked on a 4xx response, and on transport errors or
/// timeouts unless the client suppressed it.
fn should_regress(req: &ProxyRequest, result: &Result<BackendResponse>) -> bool {
    match result {
        Ok(response) => response.is_client_error(),
        Err(_) => !req.suppresses_regression(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use http::StatusCode;
    use repligate_storages::NO_REGRESSION_HEADER;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_regression_map_is_a_cycle() {
        let shards: BTreeMap<String, Arc<ShardClient>> =
            ["a", "b", "c"].iter().map(|name| shard_of(name, &[])).collect();
        let weighted: Vec<(String, f64)> =
            ["a", "b", "c"].iter().map(|n| (n.to_string(), 1.0)).collect();
        let ring = ShardsRing::new(
            &weighted,
            shards,
            RingProps { consistency_level: ConsistencyLevel::None, read_repair: false },
            "x-amz-meta-object-version",
        )
        .unwrap();

        let map = ring.regression_map();
        // Every shard appears exactly once as key and once as value
        assert_eq!(map.len(), 3);
        let mut values: Vec<&str> = map.values().map(|s| s.as_str()).collect();
        values.sort_unstable();
        assert_eq!(values, vec!["a", "b", "c"]);
        // Walking the map from any shard visits all others then wraps
        let mut seen = vec!["a".to_string()];
        let mut current = "a".to_string();
        for _ in 0..2 {
            current = map[&current].clone();
            seen.push(current.clone());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(map[&current], "a");
    }

    #[tokio::test]
    async fn test_regression_on_404_reaches_fallback() {
        // Find which shard the key lands on, make it 404, make its
        // fallback 200
        let (bad_ep, bad_hits) = spawn_backend(StatusCode::NOT_FOUND, vec![]).await;
        let (good_ep, good_hits) =
            spawn_backend(StatusCode::OK, vec![("x-amz-meta-object-version", "7".into())]).await;

        let probe = ring_over(
            vec![shard_of("alpha", &[]), shard_of("beta", &[])],
            "x-amz-meta-object-version",
        );
        let (picked, _) = probe.pick("/bucket/object").unwrap();
        let (origin_name, fallback_name) =
            if picked == "alpha" { ("alpha", "beta") } else { ("beta", "alpha") };

        let ring = ring_over(
            vec![shard_of(origin_name, &[&bad_ep]), shard_of(fallback_name, &[&good_ep])],
            "x-amz-meta-object-version",
        );

        let req = get_request("/bucket/object");
        let response = ring.do_request(&req).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(bad_hits.load(Ordering::SeqCst), 1);
        assert_eq!(good_hits.load(Ordering::SeqCst), 1);
        // Successful GET from the fallback lifts the version
        assert_eq!(req.context.read_repair_version(), Some(7));
    }

    #[tokio::test]
    async fn test_regression_never_revisits_origin() {
        // Both shards 404: the walk must stop after visiting each once
        let (ep1, hits1) = spawn_backend(StatusCode::NOT_FOUND, vec![]).await;
        let (ep2, hits2) = spawn_backend(StatusCode::NOT_FOUND, vec![]).await;

        let ring = ring_over(
            vec![shard_of("alpha", &[&ep1]), shard_of("beta", &[&ep2])],
            "x-amz-meta-object-version",
        );

        let req = get_request("/bucket/object");
        let response = ring.do_request(&req).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(hits1.load(Ordering::SeqCst), 1);
        assert_eq!(hits2.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_regression_header_suppresses_timeout_fallback() {
        // Unreachable origin (connection refused) with the suppression
        // header: the transport error surfaces instead of a fallback hit
        let (good_ep, good_hits) = spawn_backend(StatusCode::OK, vec![]).await;

        let probe = ring_over(
            vec![shard_of("alpha", &[]), shard_of("beta", &[])],
            "x-amz-meta-object-version",
        );
        let (picked, _) = probe.pick("/bucket/object").unwrap();
        let (origin_name, fallback_name) =
            if picked == "alpha" { ("alpha", "beta") } else { ("beta", "alpha") };

        let ring = ring_over(
            vec![
                // Nothing listens on port 9 in the test environment
                shard_of(origin_name, &["http://127.0.0.1:9"]),
                shard_of(fallback_name, &[&good_ep]),
            ],
            "x-amz-meta-object-version",
        );

        let mut headers = http::HeaderMap::new();
        headers.insert(NO_REGRESSION_HEADER, http::HeaderValue::from_static("1"));
        let req = request(Method::GET, "/bucket/object", headers);

        assert!(ring.do_request(&req).await.is_err());
        assert_eq!(good_hits.load(Ordering::SeqCst), 0);

        // Without the header the same topology regresses
        let req = get_request("/bucket/object");
        let response = ring.do_request(&req).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(good_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_and_bucket_paths_fan_out_to_all_shards() {
        let (ep1, hits1) = spawn_backend(StatusCode::OK, vec![]).await;
        let (ep2, hits2) = spawn_backend(StatusCode::OK, vec![]).await;

        let ring = ring_over(
            vec![shard_of("alpha", &[&ep1]), shard_of("beta", &[&ep2])],
            "x-amz-meta-object-version",
        );

        // DELETE on an object path reaches both shards
        let req = request(Method::DELETE, "/bucket/object", http::HeaderMap::new());
        ring.do_request(&req).await.unwrap();
        assert_eq!(hits1.load(Ordering::SeqCst), 1);
        assert_eq!(hits2.load(Ordering::SeqCst), 1);

        // Bucket-scoped GET reaches both shards
        let req = get_request("/bucket");
        ring.do_request(&req).await.unwrap();
        assert_eq!(hits1.load(Ordering::SeqCst), 2);
        assert_eq!(hits2.load(Ordering::SeqCst), 2);
    }
}

//! Weighted consistent-hash ring
//!
//! Maps object paths to shard names. Each shard contributes
//! `floor(weight * 100)` virtual points; a key is routed to the first
//! point at or after its hash, wrapping around. The mapping is a pure
//! function of the (name, weight) set, so it is stable across restarts
//! that preserve the topology.

use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

/// Ring lookup errors
#[derive(Debug, Clone, Error)]
pub enum RingError {
    #[error("no shard for key {0}: ring is empty")]
    NoShardForKey(String),
}

/// A single virtual point on the ring
#[derive(Debug, Clone)]
struct Point {
    hash: u64,
    shard: usize,
}

/// Weighted consistent-hash ring over shard names
#[derive(Debug, Clone)]
pub struct HashRing {
    shards: Vec<String>,
    points: Vec<Point>,
}

impl HashRing {
    /// Build a ring from (shard name, weight) pairs.
    ///
    /// Weights are fractions in [0, 1]; a weight of 0 contributes no
    /// points and effectively removes the shard from routing.
    pub fn with_weights<S: AsRef<str>>(weighted: &[(S, f64)]) -> Self {
        // Sorted shard list makes point generation order-independent and
        // gives the lexicographic tie-break.
        let mut shards: Vec<(String, u32)> = weighted
            .iter()
            .map(|(name, weight)| {
                (name.as_ref().to_string(), (weight * 100.0).floor() as u32)
            })
            .collect();
        shards.sort_by(|a, b| a.0.cmp(&b.0));

        let mut points = Vec::new();
        for (idx, (name, point_count)) in shards.iter().enumerate() {
            for i in 0..*point_count {
                let hash = xxh64(format!("{name}-{i}").as_bytes(), 0);
                points.push(Point { hash, shard: idx });
            }
        }
        // Equal hashes resolve to the lexicographically smaller shard,
        // which is the smaller index after the sort above.
        points.sort_by(|a, b| a.hash.cmp(&b.hash).then(a.shard.cmp(&b.shard)));
        // On a point-hash collision the lexicographically smaller shard wins
        points.dedup_by(|a, b| a.hash == b.hash);

        Self {
            shards: shards.into_iter().map(|(name, _)| name).collect(),
            points,
        }
    }

    /// Build an unweighted ring (every member at weight 1.0)
    pub fn new<S: AsRef<str>>(members: &[S]) -> Self {
        let weighted: Vec<(&str, f64)> =
            members.iter().map(|m| (m.as_ref(), 1.0)).collect();
        Self::with_weights(&weighted)
    }

    /// Map a key to its shard name
    pub fn pick(&self, key: &str) -> Result<&str, RingError> {
        if self.points.is_empty() {
            return Err(RingError::NoShardForKey(key.to_string()));
        }
        let hash = xxh64(key.as_bytes(), 0);
        let idx = match self.points.binary_search_by(|p| p.hash.cmp(&hash)) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0,
            Err(i) => i,
        };
        Ok(&self.shards[self.points[idx].shard])
    }

    /// Shard names present on the ring (weight > 0), sorted
    #[must_use]
    pub fn members(&self) -> Vec<&str> {
        let mut seen = vec![false; self.shards.len()];
        for point in &self.points {
            seen[point.shard] = true;
        }
        self.shards
            .iter()
            .enumerate()
            .filter(|(i, _)| seen[*i])
            .map(|(_, name)| name.as_str())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

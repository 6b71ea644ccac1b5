//! Region router
//!
//! Maps Host-header domains to their region's consistent ring. The whole
//! map is immutable once published; a config reload builds a fresh map
//! and swaps it in under the write lock, bumping a generation counter
//! that lets the reconciler's ring cache notice the change.

use crate::consistent::ConsistentRing;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

struct Inner {
    regions: HashMap<String, Arc<ConsistentRing>>,
    generation: u64,
}

/// Shared, reloadable domain → ring map
pub struct RegionRouter {
    inner: RwLock<Inner>,
}

impl RegionRouter {
    #[must_use]
    pub fn new(regions: HashMap<String, Arc<ConsistentRing>>) -> Self {
        Self { inner: RwLock::new(Inner { regions, generation: 1 }) }
    }

    /// Ring for a Host header value (port stripped)
    #[must_use]
    pub fn ring_for_host(&self, host: &str) -> Option<Arc<ConsistentRing>> {
        let domain = host.split(':').next().unwrap_or(host);
        self.inner.read().regions.get(domain).cloned()
    }

    /// Ring for an exact domain, with the current generation
    #[must_use]
    pub fn ring_for_domain(&self, domain: &str) -> Option<(Arc<ConsistentRing>, u64)> {
        let inner = self.inner.read();
        inner
            .regions
            .get(domain)
            .cloned()
            .map(|ring| (ring, inner.generation))
    }

    /// Publish a new map atomically
    pub fn replace(&self, regions: HashMap<String, Arc<ConsistentRing>>) {
        let mut inner = self.inner.write();
        inner.regions = regions;
        inner.generation += 1;
    }

    /// Current map generation; changes on every `replace`
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }
}

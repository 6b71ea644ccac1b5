//! Shard routing and the consistency gate
//!
//! A `ShardsRing` maps object paths onto shards, walks the regression
//! chain on failures and fans bucket-scoped requests and DELETEs out to
//! the whole region. The `ConsistentRing` wraps it with the write-ahead
//! consistency bookkeeping, and the `RegionRouter` maps Host-header
//! domains to rings, atomically swappable on config reload.

pub mod authenticator;
pub mod consistent;
pub mod ring;
pub mod router;

#[cfg(test)]
pub(crate) mod test_support;

pub use authenticator::Authenticator;
pub use consistent::ConsistentRing;
pub use ring::{RingProps, ShardsRing};
pub use router::RegionRouter;

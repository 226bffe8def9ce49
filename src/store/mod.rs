//! Coordination Store
//!
//! The coordination store is the source of truth for membership and
//! liveness. WolfElect only needs a small surface of it: leases with a
//! TTL, key writes bound to a lease, lease renewal, and prefix scans.

mod etcd;
mod memory;

use std::time::Duration;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::error::Result;

/// Store-issued lease identifier
pub type LeaseId = i64;

/// A key-value pair returned by a prefix scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

impl KeyValue {
    /// Create a new key-value pair
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Operations the coordinator needs from a coordination store
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease that expires unless renewed within `ttl`
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Write `key` bound to `lease`; the key disappears with the lease
    async fn put_with_lease(&self, key: &str, value: &[u8], lease: LeaseId) -> Result<()>;

    /// All entries whose key starts with `prefix`, ordered by key descending
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Renew a lease. Returns the new TTL, or `None` if the lease no longer exists
    async fn keep_alive(&self, lease: LeaseId) -> Result<Option<Duration>>;

    /// Revoke a lease and delete every key bound to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Close the client session
    async fn close(&self) -> Result<()>;
}

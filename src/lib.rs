//! WolfElect - Lease-Backed Leader Election
//!
//! Gives every process in a fleet a durable, key-derived identity and a
//! continuously updated answer to "am I the leader?", using etcd as the
//! source of truth for membership and liveness.
//!
//! # Architecture
//!
//! WolfElect does not implement consensus. Each node registers a marker
//! `node:<node id>` bound to a short lease and keeps the lease alive. Every
//! node periodically reads all live markers and treats the lexicographically
//! smallest node id as the leader, so agreement follows from the store's
//! consistent view of membership.
//!
//! # Features
//!
//! - Ed25519 node identity persisted in the data directory
//! - Lease-backed membership with background renewal
//! - Periodic election with a thread-safe leadership flag and change notifications
//! - Configurable fault policy (halt or retry with backoff) with loop health reporting
//! - etcd v3 backend over the JSON gateway, plus an in-process store

pub mod config;
pub mod error;
pub mod identity;
pub mod store;
pub mod state;
pub mod coordinator;

pub use config::ElectorConfig;
pub use coordinator::{Coordinator, CoordinatorStatus};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ElectorConfig, FaultPolicy};
    pub use crate::coordinator::Coordinator;
    pub use crate::error::{Error, Result};
    pub use crate::identity::{NodeId, NodeIdentity};
    pub use crate::state::{ElectionState, LoopHealth, MembershipSnapshot};
    pub use crate::store::{CoordinationStore, EtcdStore, MemoryStore};
}

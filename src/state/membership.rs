//! Cluster Membership
//!
//! Membership lives in the coordination store as one marker per live node:
//! `node:<node id>` -> `.`, bound to that node's lease. Anything else under
//! the prefix is ignored.

use std::time::Duration;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::store::{CoordinationStore, KeyValue};

/// Key namespace of membership markers
pub const MEMBER_PREFIX: &str = "node:";

/// Value that marks a key as a live membership marker
pub const LIVE_MARKER: &[u8] = b".";

/// Store key of a node's membership marker
pub fn member_key(node_id: &NodeId) -> String {
    format!("{}{}", MEMBER_PREFIX, node_id)
}

/// Extract the node id from a membership marker
///
/// Returns `None` for anything that is not exactly `node:<id>` with a
/// non-empty id and the live marker value.
pub fn parse_member(kv: &KeyValue) -> Option<NodeId> {
    if kv.value != LIVE_MARKER {
        return None;
    }

    let mut parts = kv.key.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("node"), Some(id), None) if !id.is_empty() => Some(NodeId::new(id)),
        _ => None,
    }
}

/// Live node ids observed at one point in time, ascending
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembershipSnapshot {
    members: Vec<NodeId>,
}

impl MembershipSnapshot {
    /// Build a snapshot from raw store entries, skipping malformed ones
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a KeyValue>) -> Self {
        Self::from_ids(entries.into_iter().filter_map(parse_member))
    }

    /// Build a snapshot from node ids in any order
    pub fn from_ids(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let mut members: Vec<NodeId> = ids.into_iter().collect();
        members.sort();
        members.dedup();
        Self { members }
    }

    /// The leader: lexicographically smallest live node id
    pub fn leader(&self) -> Option<&NodeId> {
        self.members.first()
    }

    /// Whether `node_id` is live in this snapshot
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.members.binary_search(node_id).is_ok()
    }

    /// All members, ascending
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Read the current membership from the store, bounded by `timeout`
pub async fn fetch_snapshot(
    store: &dyn CoordinationStore,
    timeout: Duration,
) -> Result<MembershipSnapshot> {
    let entries = tokio::time::timeout(timeout, store.get_prefix(MEMBER_PREFIX))
        .await
        .map_err(|_| Error::StoreTimeout(timeout))??;

    let snapshot = MembershipSnapshot::from_entries(&entries);
    if snapshot.len() != entries.len() {
        tracing::trace!(
            "Ignored {} non-member entries under {}",
            entries.len() - snapshot.len(),
            MEMBER_PREFIX
        );
    }
    Ok(snapshot)
}

//! Registration & Liveness
//!
//! Announces this node under a lease and keeps the lease alive from a
//! background task. When renewals stop, the store expires the lease and the
//! membership marker disappears for every observer, this node included.

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::membership::{member_key, LIVE_MARKER};
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::store::{CoordinationStore, LeaseId};

/// Floor for the renewal period so tiny TTLs do not spin
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(100);

/// Renew three times per TTL window
pub fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_RENEWAL_INTERVAL)
}

/// A live membership registration
pub struct Registration {
    node_id: NodeId,
    lease: LeaseId,
    ttl: Duration,
    registered_at: DateTime<Utc>,
    store: Arc<dyn CoordinationStore>,
    shutdown: watch::Sender<bool>,
    keepalive: Option<JoinHandle<()>>,
}

/// Announce `node_id` under a fresh lease and start renewing it
///
/// Fails with [`Error::Registration`] if the lease cannot be granted or the
/// marker cannot be written; no background task is left running then.
pub async fn register(
    store: Arc<dyn CoordinationStore>,
    node_id: &NodeId,
    ttl: Duration,
) -> Result<Registration> {
    tracing::info!("Registering node {} in the coordination store", node_id);

    let lease = store
        .grant_lease(ttl)
        .await
        .map_err(|e| Error::registration("granting lease", e))?;

    if let Err(e) = store.put_with_lease(&member_key(node_id), LIVE_MARKER, lease).await {
        if let Err(revoke_err) = store.revoke_lease(lease).await {
            tracing::warn!("Failed to revoke lease {} after failed registration: {}", lease, revoke_err);
        }
        return Err(Error::registration("writing membership marker", e));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let keepalive = tokio::spawn(
        keep_alive_loop(Arc::clone(&store), lease, ttl, shutdown_rx).in_current_span(),
    );

    tracing::info!("Registration complete (lease {}, ttl {:?})", lease, ttl);

    Ok(Registration {
        node_id: node_id.clone(),
        lease,
        ttl,
        registered_at: Utc::now(),
        store,
        shutdown: shutdown_tx,
        keepalive: Some(keepalive),
    })
}

async fn keep_alive_loop(
    store: Arc<dyn CoordinationStore>,
    lease: LeaseId,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = renewal_interval(ttl);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }

        match store.keep_alive(lease).await {
            Ok(Some(remaining)) => {
                tracing::trace!("Renewed lease {} ({:?} left)", lease, remaining);
            }
            Ok(None) => {
                tracing::error!(
                    "Membership lease {} has lapsed; this node is no longer a cluster member",
                    lease
                );
                break;
            }
            Err(e) => {
                tracing::warn!("Renewal of lease {} failed: {}; retrying in {:?}", lease, e, period);
            }
        }
    }

    tracing::debug!("Keepalive for lease {} stopped", lease);
}

impl Registration {
    /// Registered node id
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Lease backing the membership marker
    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    /// Lease TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// When the marker was written
    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Whether the keepalive task is still running
    pub fn is_renewing(&self) -> bool {
        self.keepalive.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop renewing and revoke the lease
    ///
    /// Revocation is best effort: if it fails the store still expires the
    /// lease within its TTL. Calling this again is a no-op.
    pub async fn release(&mut self) {
        let Some(handle) = self.keepalive.take() else {
            return;
        };

        self.shutdown.send_replace(true);
        if let Err(e) = handle.await {
            tracing::warn!("Keepalive task ended abnormally: {}", e);
        }

        match self.store.revoke_lease(self.lease).await {
            Ok(()) => tracing::info!("Released membership of node {}", self.node_id),
            Err(e) => tracing::warn!(
                "Failed to revoke lease {} ({}); marker expires within {:?}",
                self.lease,
                e,
                self.ttl
            ),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

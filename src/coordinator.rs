//! Coordinator Lifecycle
//!
//! Wires identity, registration and the election loop together:
//! start resolves the identity, registers under a lease and launches the
//! election loop; stop tears all of it down again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::ElectorConfig;
use crate::error::Result;
use crate::identity::{ensure_identity, NodeId, NodeIdentity};
use crate::state::{register, ElectionLoop, ElectionState, Leadership, LoopHealth, Registration};
use crate::store::{CoordinationStore, EtcdStore};

/// Snapshot of a coordinator's view, for status output
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub node_id: NodeId,
    pub key_id: String,
    pub state: ElectionState,
    pub leader_id: Option<NodeId>,
    pub health: LoopHealth,
    pub started_at: DateTime<Utc>,
}

/// A running leader election participant
///
/// All accessors are safe to call from any thread while the election loop
/// runs. `stop` may be called any number of times.
pub struct Coordinator {
    identity: NodeIdentity,
    node_id: NodeId,
    store: Arc<dyn CoordinationStore>,
    leadership: Arc<Leadership>,
    shutdown: watch::Sender<bool>,
    registration: Mutex<Option<Registration>>,
    election_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    /// Whether this coordinator connected the store itself
    owns_store: bool,
    started_at: DateTime<Utc>,
}

impl Coordinator {
    /// Validate `config`, connect to etcd and start participating
    pub async fn start(config: ElectorConfig) -> Result<Self> {
        config.validate()?;

        let store = EtcdStore::connect(
            &config.store.endpoints,
            config.dial_timeout(),
            config.request_timeout(),
        )
        .await?;

        Self::start_inner(config, Arc::new(store), true).await
    }

    /// Start participating using an already connected store
    ///
    /// Returns once the membership marker is written; the election loop
    /// keeps running in the background. The store stays open when this
    /// coordinator stops or fails to start, since other holders may share it.
    pub async fn start_with_store(
        config: ElectorConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<Self> {
        Self::start_inner(config, store, false).await
    }

    async fn start_inner(
        config: ElectorConfig,
        store: Arc<dyn CoordinationStore>,
        owns_store: bool,
    ) -> Result<Self> {
        config.validate_local()?;

        let span = tracing::info_span!(
            "wolfelect",
            label = config.node.name.as_deref().unwrap_or("-"),
            node = tracing::field::Empty,
        );

        let result = Self::launch(&config, Arc::clone(&store), owns_store)
            .instrument(span)
            .await;
        if result.is_err() && owns_store {
            if let Err(e) = store.close().await {
                tracing::debug!("Closing store after failed start: {}", e);
            }
        }
        result
    }

    async fn launch(
        config: &ElectorConfig,
        store: Arc<dyn CoordinationStore>,
        owns_store: bool,
    ) -> Result<Self> {
        tracing::info!("Starting wolfelect...");

        let identity = ensure_identity(config.data_dir())?;
        let node_id = identity.node_id();
        tracing::Span::current().record("node", node_id.as_str());
        tracing::info!("Our node id is {} (key {})", node_id, identity.key_id());

        let registration = register(Arc::clone(&store), &node_id, config.lease_ttl()).await?;

        let leadership = Arc::new(Leadership::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let election = ElectionLoop::new(
            node_id.clone(),
            Arc::clone(&store),
            Arc::clone(&leadership),
            config.election.clone(),
            shutdown_rx,
        );
        let election_task = tokio::spawn(election.run().in_current_span());

        tracing::info!(
            "Election loop running every {:?}",
            config.election.interval()
        );

        Ok(Self {
            identity,
            node_id,
            store,
            leadership,
            shutdown: shutdown_tx,
            registration: Mutex::new(Some(registration)),
            election_task: Mutex::new(Some(election_task)),
            stopped: AtomicBool::new(false),
            owns_store,
            started_at: Utc::now(),
        })
    }

    /// Stop the election loop and release membership
    ///
    /// Closes the store session only if [`Coordinator::start`] opened it.
    /// After this returns the node no longer appears in membership. Calls
    /// after the first are no-ops.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Coordinator {} already stopped", self.node_id);
            return Ok(());
        }

        tracing::info!("Stopping coordinator {}", self.node_id);
        self.shutdown.send_replace(true);

        if let Some(task) = self.election_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Election loop ended abnormally: {}", e);
            }
        }

        if let Some(mut registration) = self.registration.lock().await.take() {
            registration.release().await;
        }

        if self.leadership.update(false) {
            tracing::info!(leader = false, "Stepped down from leadership");
        }
        self.leadership.set_current_leader(None);
        self.leadership.set_health(LoopHealth::Stopped);

        if self.owns_store {
            self.store.close().await?;
        }
        tracing::info!("Coordinator {} stopped", self.node_id);
        Ok(())
    }

    /// Whether this node is currently the leader
    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    /// This node's id
    pub fn self_id(&self) -> &NodeId {
        &self.node_id
    }

    /// This node's key pair
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Current election state
    pub fn state(&self) -> ElectionState {
        self.leadership.state()
    }

    /// Leader computed by the last successful tick
    pub fn current_leader(&self) -> Option<NodeId> {
        self.leadership.current_leader()
    }

    /// Election loop health
    pub fn health(&self) -> LoopHealth {
        self.leadership.health()
    }

    /// Receive leadership transitions (`true` = became leader)
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Current status summary
    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            node_id: self.node_id.clone(),
            key_id: self.identity.key_id().to_string(),
            state: self.state(),
            leader_id: self.current_leader(),
            health: self.health(),
            started_at: self.started_at,
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // Background tasks end; an unreleased lease expires store-side
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultPolicy;
    use crate::error::Error;
    use crate::identity::key_path;
    use crate::state::fetch_snapshot;
    use crate::store::{KeyValue, LeaseId, MemoryStore};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    /// Store whose `close` ends the session for every holder, like etcd
    struct SessionStore {
        inner: MemoryStore,
        closed: AtomicBool,
    }

    impl SessionStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                closed: AtomicBool::new(false),
            }
        }

        fn check_open(&self) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::StoreClosed);
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl CoordinationStore for SessionStore {
        async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
            self.check_open()?;
            self.inner.grant_lease(ttl).await
        }
        async fn put_with_lease(&self, key: &str, value: &[u8], lease: LeaseId) -> Result<()> {
            self.check_open()?;
            self.inner.put_with_lease(key, value, lease).await
        }
        async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
            self.check_open()?;
            self.inner.get_prefix(prefix).await
        }
        async fn keep_alive(&self, lease: LeaseId) -> Result<Option<Duration>> {
            self.check_open()?;
            self.inner.keep_alive(lease).await
        }
        async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
            self.check_open()?;
            self.inner.revoke_lease(lease).await
        }
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config(dir: &TempDir) -> ElectorConfig {
        let mut config = ElectorConfig::new(dir.path(), vec!["memory".to_string()]);
        config.store.lease_ttl_secs = 5;
        config.election.interval_ms = 1000;
        config.election.query_timeout_ms = 500;
        config.election.on_store_error = FaultPolicy::Retry;
        config
    }

    async fn member_count(store: &MemoryStore) -> usize {
        fetch_snapshot(store, Duration::from_secs(1)).await.unwrap().len()
    }

    #[tokio::test]
    async fn test_empty_endpoints_rejected() {
        let dir = tempdir().unwrap();
        let config = ElectorConfig::new(dir.path(), Vec::new());

        let err = Coordinator::start(config).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        // Nothing was created
        assert!(!key_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_empty_data_dir_rejected() {
        let store = Arc::new(MemoryStore::new());
        let config = ElectorConfig::new("", vec!["memory".to_string()]);

        let err = Coordinator::start_with_store(config, store.clone()).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_becomes_leader() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        let node = Coordinator::start_with_store(test_config(&dir), store.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(node.is_leader());
        assert_eq!(node.current_leader().as_ref(), Some(node.self_id()));
        assert!(node.health().is_running());
        node.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_leader_and_failover() {
        let store = Arc::new(MemoryStore::new());
        let dirs: Vec<TempDir> = (0..3).map(|_| tempdir().unwrap()).collect();

        let mut nodes = Vec::new();
        for dir in &dirs {
            nodes.push(Coordinator::start_with_store(test_config(dir), store.clone()).await.unwrap());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(nodes.iter().filter(|n| n.is_leader()).count(), 1);
        let lowest = nodes.iter().map(|n| n.self_id().clone()).min().unwrap();
        let leader_idx = nodes.iter().position(|n| n.is_leader()).unwrap();
        assert_eq!(nodes[leader_idx].self_id(), &lowest);

        let old_leader = nodes.remove(leader_idx);
        old_leader.stop().await.unwrap();
        assert!(!old_leader.is_leader());

        // Stop revokes the lease, so one tick is enough
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(nodes.iter().filter(|n| n.is_leader()).count(), 1);
        assert_eq!(member_count(&store).await, 2);

        for node in &nodes {
            node.stop().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_releases_membership() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        let node = Coordinator::start_with_store(test_config(&dir), store.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut changes = node.subscribe();

        node.stop().await.unwrap();
        node.stop().await.unwrap();

        assert!(node.is_stopped());
        assert!(!node.is_leader());
        assert_eq!(node.health(), LoopHealth::Stopped);
        assert!(changes.has_changed().unwrap());
        assert!(!*changes.borrow_and_update());
        assert_eq!(member_count(&store).await, 0);
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_survives_restart() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        let first = Coordinator::start_with_store(test_config(&dir), store.clone()).await.unwrap();
        let first_id = first.self_id().clone();
        first.stop().await.unwrap();

        let second = Coordinator::start_with_store(test_config(&dir), store.clone()).await.unwrap();
        assert_eq!(second.self_id(), &first_id);
        assert_eq!(second.identity().key_id(), first.identity().key_id());
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_identity_fails_start_without_registering() {
        let dir = tempdir().unwrap();
        std::fs::write(key_path(dir.path()), "garbage").unwrap();
        let store = Arc::new(MemoryStore::new());

        let err = Coordinator::start_with_store(test_config(&dir), store.clone()).await.err().unwrap();
        assert!(matches!(err, Error::IdentityCorrupt { .. }));
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_registration() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);

        let err = Coordinator::start_with_store(test_config(&dir), store.clone()).await.err().unwrap();
        assert!(matches!(err, Error::Registration { .. }));

        store.set_unavailable(false);
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_leader() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        let node = Coordinator::start_with_store(test_config(&dir), store).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = node.status();
        assert_eq!(status.state, ElectionState::Leader);
        assert_eq!(status.leader_id.as_ref(), Some(node.self_id()));
        assert_eq!(status.key_id, node.identity().key_id());
        node.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_one_node_leaves_shared_store_open() {
        let store = Arc::new(SessionStore::new());
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();

        let a = Coordinator::start_with_store(test_config(&dir_a), store.clone()).await.unwrap();
        let b = Coordinator::start_with_store(test_config(&dir_b), store.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let (stopping, survivor) = if a.is_leader() { (b, a) } else { (a, b) };
        stopping.stop().await.unwrap();

        // Several ticks and TTLs later the survivor is still a healthy, registered leader
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!store.closed.load(Ordering::SeqCst));
        assert!(survivor.is_leader());
        assert!(matches!(survivor.health(), LoopHealth::Healthy { members: 1, .. }));
        let snapshot = fetch_snapshot(store.as_ref(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(snapshot.members(), &[survivor.self_id().clone()]);

        survivor.stop().await.unwrap();
        assert!(!store.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_start_leaves_shared_store_open() {
        let store = Arc::new(SessionStore::new());
        let corrupt = tempdir().unwrap();
        std::fs::write(key_path(corrupt.path()), "garbage").unwrap();

        let err = Coordinator::start_with_store(test_config(&corrupt), store.clone()).await.err().unwrap();
        assert!(matches!(err, Error::IdentityCorrupt { .. }));
        assert!(!store.closed.load(Ordering::SeqCst));

        let healthy = tempdir().unwrap();
        let node = Coordinator::start_with_store(test_config(&healthy), store.clone()).await.unwrap();
        node.stop().await.unwrap();
    }
}

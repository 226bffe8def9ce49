//! Leader Election
//!
//! Polls the coordination store on a fixed interval, orders the live node
//! ids and elects the lexicographically smallest one. There is no voting:
//! agreement comes from every node reading the same consistent membership.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use super::membership::fetch_snapshot;
use crate::config::{ElectionConfig, FaultPolicy};
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::store::CoordinationStore;

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElectionState {
    /// Following a leader
    Follower,
    /// This node is the leader
    Leader,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Follower => write!(f, "FOLLOWER"),
            ElectionState::Leader => write!(f, "LEADER"),
        }
    }
}

/// Health of the election loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoopHealth {
    /// No tick has completed yet
    Starting,
    /// Last tick succeeded
    Healthy {
        last_tick: DateTime<Utc>,
        members: usize,
    },
    /// Ticks are failing and being retried; the flag keeps its last value
    Degraded {
        consecutive_failures: u32,
        last_error: String,
    },
    /// The loop gave up; the flag is frozen
    Faulted { error: String },
    /// The coordinator was stopped
    Stopped,
}

impl LoopHealth {
    /// Whether the loop is still updating leadership
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            LoopHealth::Starting | LoopHealth::Healthy { .. } | LoopHealth::Degraded { .. }
        )
    }
}

impl std::fmt::Display for LoopHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopHealth::Starting => write!(f, "STARTING"),
            LoopHealth::Healthy { members, .. } => write!(f, "HEALTHY ({} members)", members),
            LoopHealth::Degraded {
                consecutive_failures,
                ..
            } => write!(f, "DEGRADED ({} failed ticks)", consecutive_failures),
            LoopHealth::Faulted { .. } => write!(f, "FAULTED"),
            LoopHealth::Stopped => write!(f, "STOPPED"),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Leadership state owned by one coordinator
///
/// Written only by the election loop (and by stop); read from anywhere.
pub struct Leadership {
    is_leader: RwLock<bool>,
    current_leader: RwLock<Option<NodeId>>,
    health: RwLock<LoopHealth>,
    changes: watch::Sender<bool>,
}

impl Default for Leadership {
    fn default() -> Self {
        Self::new()
    }
}

impl Leadership {
    /// Create a follower state
    pub fn new() -> Self {
        let (changes, _) = watch::channel(false);
        Self {
            is_leader: RwLock::new(false),
            current_leader: RwLock::new(None),
            health: RwLock::new(LoopHealth::Starting),
            changes,
        }
    }

    /// Whether this node is currently the leader
    pub fn is_leader(&self) -> bool {
        *read(&self.is_leader)
    }

    /// Current election state
    pub fn state(&self) -> ElectionState {
        if self.is_leader() {
            ElectionState::Leader
        } else {
            ElectionState::Follower
        }
    }

    /// Leader computed by the last successful tick
    pub fn current_leader(&self) -> Option<NodeId> {
        read(&self.current_leader).clone()
    }

    /// Election loop health
    pub fn health(&self) -> LoopHealth {
        read(&self.health).clone()
    }

    /// Receive every leadership transition
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.changes.subscribe()
    }

    /// Set the flag; returns the previous value
    pub(crate) fn update(&self, is_leader: bool) -> bool {
        let previous = std::mem::replace(&mut *write(&self.is_leader), is_leader);
        if previous != is_leader {
            self.changes.send_replace(is_leader);
        }
        previous
    }

    pub(crate) fn set_current_leader(&self, leader: Option<NodeId>) {
        *write(&self.current_leader) = leader;
    }

    pub(crate) fn set_health(&self, health: LoopHealth) {
        *write(&self.health) = health;
    }
}

/// Periodic poll-sort-decide loop for one node
pub struct ElectionLoop {
    node_id: NodeId,
    store: Arc<dyn CoordinationStore>,
    leadership: Arc<Leadership>,
    config: ElectionConfig,
    shutdown: watch::Receiver<bool>,
}

impl ElectionLoop {
    /// Create an election loop
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn CoordinationStore>,
        leadership: Arc<Leadership>,
        config: ElectionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            node_id,
            store,
            leadership,
            config,
            shutdown,
        }
    }

    /// Run one tick: read membership, elect, update the flag
    ///
    /// Returns whether this node is the leader. An empty snapshot is an
    /// error: it means this node's own marker has lapsed.
    pub async fn tick(&self) -> Result<bool> {
        let snapshot = fetch_snapshot(self.store.as_ref(), self.config.query_timeout()).await?;
        let leader = snapshot.leader().ok_or(Error::EmptyMembership)?;

        if !snapshot.contains(&self.node_id) {
            tracing::debug!("Own marker for {} missing from membership", self.node_id);
        }

        let is_leader = *leader == self.node_id;
        self.leadership.set_current_leader(Some(leader.clone()));

        let was_leader = self.leadership.update(is_leader);
        if was_leader != is_leader {
            tracing::info!(
                leader = is_leader,
                "Leadership status changed: now {} (leader is {})",
                self.leadership.state(),
                leader
            );
        }

        self.leadership.set_health(LoopHealth::Healthy {
            last_tick: Utc::now(),
            members: snapshot.len(),
        });

        Ok(is_leader)
    }

    /// Run until shutdown is signalled or the fault policy gives up
    pub async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            let delay = match self.tick().await {
                Ok(_) => {
                    if failures > 0 {
                        tracing::info!("Election loop recovered after {} failed ticks", failures);
                    }
                    failures = 0;
                    self.config.interval()
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    match self.on_failure(failures, &e) {
                        Some(backoff) => backoff,
                        None => return,
                    }
                }
            };

            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if *self.shutdown.borrow() {
                break;
            }
        }

        tracing::debug!("Election loop for {} stopped", self.node_id);
    }

    /// Apply the fault policy; `None` means the loop must end
    fn on_failure(&self, failures: u32, error: &Error) -> Option<std::time::Duration> {
        let give_up = match self.config.on_store_error {
            FaultPolicy::Halt => true,
            FaultPolicy::Retry => {
                self.config.max_consecutive_failures > 0
                    && failures > self.config.max_consecutive_failures
            }
        };

        if give_up {
            tracing::error!(
                "Election loop halted after {} failed ticks: {}; leadership frozen at {}",
                failures,
                error,
                self.leadership.state()
            );
            self.leadership.set_health(LoopHealth::Faulted {
                error: error.to_string(),
            });
            return None;
        }

        let backoff = self.config.retry_backoff(failures);
        tracing::warn!(
            "Election tick failed ({} in a row): {}; retrying in {:?}",
            failures,
            error,
            backoff
        );
        self.leadership.set_health(LoopHealth::Degraded {
            consecutive_failures: failures,
            last_error: error.to_string(),
        });
        Some(backoff)
    }
}

//! In-process coordination store
//!
//! Behaves like a single etcd member: leases carry a deadline and every
//! operation first purges expired leases together with their keys. Deadlines
//! use `tokio::time::Instant` so tests can drive expiry with paused time.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{CoordinationStore, KeyValue, LeaseId};
use crate::error::{Error, Result};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
}

impl Inner {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            tracing::debug!("Lease {} expired", id);
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let existed = self.leases.remove(&id).is_some();
        self.entries.retain(|_, entry| entry.lease != Some(id));
        existed
    }
}

/// In-memory coordination store shared by every coordinator holding it
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_lease: AtomicI64,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_lease: AtomicI64::new(1),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Write a key without a lease, bypassing any validation
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let mut inner = self.lock();
        inner.entries.insert(
            key.into(),
            Entry {
                value: value.into(),
                lease: None,
            },
        );
    }

    /// Make every operation fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of leases that have not expired yet
    pub fn lease_count(&self) -> usize {
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());
        inner.leases.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    /// Lock the store after purging expired leases
    fn live(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.check_available()?;
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());
        Ok(inner)
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut inner = self.live()?;
        let id = self.next_lease.fetch_add(1, Ordering::SeqCst);
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn put_with_lease(&self, key: &str, value: &[u8], lease: LeaseId) -> Result<()> {
        let mut inner = self.live()?;
        if !inner.leases.contains_key(&lease) {
            return Err(Error::Store(format!("requested lease {} not found", lease)));
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                lease: Some(lease),
            },
        );
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let inner = self.live()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue::new(key.clone(), entry.value.clone()))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Option<Duration>> {
        let mut inner = self.live()?;
        Ok(inner.leases.get_mut(&lease).map(|l| {
            l.deadline = Instant::now() + l.ttl;
            l.ttl
        }))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.live()?;
        if !inner.drop_lease(lease) {
            tracing::debug!("Revoke of unknown lease {}", lease);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Shared by many coordinators; leases are released by revoke or expiry
        Ok(())
    }
}

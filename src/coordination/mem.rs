//! In-process coordination store.
//!
//! Single-node stand-in for a networked store: a revision-counted key
//! space with prefix watches and TTL leases, expired by a background
//! sweep. Implements the full [`CoordinationClient`] contract so the
//! registry and scheduler are exercised through the same code paths a
//! networked client would use.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::coordination::client::{
    CoordinationClient, EventKind, KeyValue, LeaseId, Revision, WatchEvent, WatchStream,
};
use crate::error::{Result, ServerError};

const WATCH_BUFFER: usize = 256;
const HISTORY_LIMIT: usize = 4096;
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Stored {
    value: String,
    revision: Revision,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    deadline: Instant,
    ttl: Duration,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    revision: Revision,
    kvs: BTreeMap<String, Stored>,
    leases: HashMap<LeaseId, Lease>,
    next_lease_id: LeaseId,
    watchers: Vec<Watcher>,
    /// Bounded replay log for watches resuming from an older revision.
    history: VecDeque<WatchEvent>,
}

impl Inner {
    fn emit(&mut self, kind: EventKind, key: String, value: String) {
        self.revision += 1;
        let event = WatchEvent {
            kind,
            key,
            value,
            revision: self.revision,
        };

        self.history.push_back(event.clone());
        if self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }

        // A watcher that cannot keep up loses its channel; the consumer
        // observes the closed stream and resubscribes from its last
        // revision.
        self.watchers.retain(|w| {
            if !event.key.starts_with(&w.prefix) {
                return true;
            }
            w.tx.try_send(event.clone()).is_ok()
        });
    }

    fn delete_key(&mut self, key: &str) -> bool {
        if self.kvs.remove(key).is_some() {
            self.emit(EventKind::Delete, key.to_string(), String::new());
            true
        } else {
            false
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in expired {
            self.leases.remove(&lease_id);
            let keys: Vec<String> = self
                .kvs
                .iter()
                .filter(|(_, s)| s.lease == Some(lease_id))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                tracing::debug!(lease_id, key = %key, "Lease expired, deleting key");
                self.delete_key(&key);
            }
        }
    }
}

/// In-process [`CoordinationClient`].
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));

        // Lease sweeper; stops once the store is dropped.
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LEASE_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.lock().await.expire_leases(Instant::now());
            }
        });

        Self { inner }
    }
}

#[async_trait]
impl CoordinationClient for MemStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let inner = self.inner.lock().await;
        Ok(inner.kvs.get(key).map(|s| KeyValue {
            key: key.to_string(),
            value: s.value.clone(),
            revision: s.revision,
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, s)| KeyValue {
                key: k.clone(),
                value: s.value.clone(),
                revision: s.revision,
            })
            .collect())
    }

    async fn current_revision(&self) -> Result<Revision> {
        Ok(self.inner.lock().await.revision)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<Revision> {
        let mut inner = self.inner.lock().await;
        if let Some(lease_id) = lease {
            if !inner.leases.contains_key(&lease_id) {
                return Err(ServerError::CoordinationUnavailable(format!(
                    "lease {lease_id} not found"
                )));
            }
        }
        inner.emit(EventKind::Put, key.to_string(), value.to_string());
        let revision = inner.revision;
        inner.kvs.insert(
            key.to_string(),
            Stored {
                value: value.to_string(),
                revision,
                lease,
            },
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().await.delete_key(key))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        let count = keys.len();
        for key in keys {
            inner.delete_key(&key);
        }
        Ok(count)
    }

    async fn watch(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut inner = self.inner.lock().await;

        for event in inner
            .history
            .iter()
            .filter(|e| e.revision > from_revision && e.key.starts_with(prefix))
        {
            if tx.try_send(event.clone()).is_err() {
                // Replay overflow; the consumer will see the stream close
                // and resubscribe.
                return Ok(rx);
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut inner = self.inner.lock().await;
        inner.next_lease_id += 1;
        let lease_id = inner.next_lease_id;
        inner.leases.insert(
            lease_id,
            Lease {
                deadline: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(lease_id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(ServerError::CoordinationUnavailable(format!(
                "lease {lease} not found"
            ))),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.leases.remove(&lease).is_none() {
            return Err(ServerError::CoordinationUnavailable(format!(
                "lease {lease} not found"
            )));
        }
        let keys: Vec<String> = inner
            .kvs
            .iter()
            .filter(|(_, s)| s.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            inner.delete_key(&key);
        }
        Ok(())
    }
}

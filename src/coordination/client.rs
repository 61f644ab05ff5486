use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Store-wide modification counter. Every successful put or delete bumps
/// it; events within a watch arrive in revision order.
pub type Revision = u64;

/// Handle to a TTL lease. Keys attached to a lease are deleted when the
/// lease expires without a keep-alive.
pub type LeaseId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision at which this key was last modified.
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty on delete events.
    pub value: String,
    pub revision: Revision,
}

/// Receiving half of a prefix watch. The sender side closing means the
/// watch broke; consumers resubscribe from the last revision they saw.
pub type WatchStream = mpsc::Receiver<WatchEvent>;

/// Contract over the distributed key-value store.
///
/// The store is authoritative for worker liveness: the absence of a key
/// implies the worker is gone.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Current store revision; the starting point for a watch that must
    /// not miss events relative to a preceding `get_prefix`.
    async fn current_revision(&self) -> Result<Revision>;

    /// Write a key, optionally attached to a lease. Returns the revision
    /// of the write.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<Revision>;

    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Returns the number of keys removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Watch a key prefix. Events with `revision > from_revision` are
    /// replayed first, then live events follow in revision order.
    async fn watch(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Push the lease deadline out by its TTL. Errors if the lease has
    /// already expired or was revoked.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revoke a lease and delete the keys attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;
}

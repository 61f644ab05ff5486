//! Coordination-store access.
//!
//! The control plane never talks to workers directly. Workers announce
//! themselves, heartbeat, and report job status through a shared
//! strongly-consistent key-value store; the server observes them through
//! prefix watches and dispatches work by writing records under agreed
//! keys.
//!
//! # Components
//!
//! - [`CoordinationClient`]: the store contract (get/put/delete, prefix
//!   watches with totally-ordered revisions, TTL leases)
//! - [`keys`]: the key layout shared with workers
//! - [`MemStore`]: in-process implementation backing single-node mode and
//!   the test suite

pub mod client;
pub mod keys;
pub mod mem;

pub use client::{
    CoordinationClient, EventKind, KeyValue, LeaseId, Revision, WatchEvent, WatchStream,
};
pub use mem::MemStore;

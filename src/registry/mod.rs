//! Worker-fleet registry.
//!
//! Workers announce themselves under `workers/<id>` and keep a leased
//! liveness sentinel at `workers/<id>/status`. The registry watches that
//! prefix and maintains the shared worker map the scheduler picks from:
//!
//! - put with an unknown id creates the worker in *joining* state; it
//!   becomes *ready* once the status sentinel is observed
//! - put on a known id refreshes `max`, `running`, and the heartbeat
//! - delete (explicit or lease expiry) marks the worker *lost* and hands
//!   its running jobs back to the scheduler for re-enqueue
//!
//! Heartbeats are monotonic per worker: events carrying a revision older
//! than one already applied for that worker are discarded.

pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::CoordinationConfig;
use crate::coordination::{keys, CoordinationClient, EventKind, Revision, WatchEvent};
use crate::error::{Result, ServerError};

pub use worker::{Worker, WorkerAnnouncement, WorkerStatus, WorkerStatusRecord};

/// Worker map shared between the app façade, the registry, and the
/// scheduler. Critical sections are field reads and writes only, never
/// I/O.
pub type SharedWorkers = Arc<RwLock<HashMap<String, Worker>>>;

/// Aggregate capacity `(total max, total running)` across ready workers.
pub async fn capacity(workers: &SharedWorkers) -> (u32, u32) {
    let workers = workers.read().await;
    workers
        .values()
        .filter(|w| w.is_ready())
        .fold((0, 0), |(max, running), w| {
            (max + w.max, running + w.running)
        })
}

/// Registry → scheduler notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A worker gained slack (heartbeat lowered `running`, raised `max`,
    /// or a worker became ready).
    CapacityChanged,
    /// A worker disappeared; its dispatched jobs need re-enqueueing.
    WorkerLost { id: String },
}

pub struct WorkerRegistry {
    client: Arc<dyn CoordinationClient>,
    workers: SharedWorkers,
    events: mpsc::Sender<RegistryEvent>,
    config: CoordinationConfig,
    shutdown: CancellationToken,
}

impl WorkerRegistry {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        workers: SharedWorkers,
        events: mpsc::Sender<RegistryEvent>,
        config: CoordinationConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            workers,
            events,
            config,
            shutdown,
        }
    }

    /// Run the watch loop until shutdown or an irrecoverable watch
    /// failure. On failure every worker is marked lost before the fatal
    /// error is returned, so the caller can surface it on the app error
    /// channel.
    pub async fn run(self) -> Result<()> {
        let mut seen: HashMap<String, Revision> = HashMap::new();
        let mut from_revision = match self.sync(&mut seen).await {
            Ok(rev) => rev,
            Err(e) => {
                self.mark_all_lost().await;
                return Err(ServerError::Fatal(format!("worker registry sync: {e}")));
            }
        };
        let mut failures: u32 = 0;

        loop {
            let mut stream = match self.client.watch(keys::WORKERS_PREFIX, from_revision).await {
                Ok(stream) => stream,
                Err(e) => {
                    failures += 1;
                    if failures > self.config.max_watch_retries {
                        self.mark_all_lost().await;
                        return Err(ServerError::Fatal(format!("worker watch: {e}")));
                    }
                    tracing::warn!(error = %e, attempt = failures, "Worker watch failed, retrying");
                    tokio::time::sleep(self.config.watch_backoff).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        tracing::info!("Worker registry shutting down");
                        return Ok(());
                    }
                    event = stream.recv() => match event {
                        Some(event) => {
                            failures = 0;
                            from_revision = event.revision;
                            self.apply(event, &mut seen).await;
                        }
                        None => {
                            tracing::warn!(
                                from_revision,
                                "Worker watch channel closed, reconnecting"
                            );
                            break;
                        }
                    }
                }
            }

            failures += 1;
            if failures > self.config.max_watch_retries {
                self.mark_all_lost().await;
                return Err(ServerError::Fatal(
                    "worker watch could not be re-established".to_string(),
                ));
            }
            tokio::time::sleep(self.config.watch_backoff).await;
        }
    }

    /// Seed the worker map from the current store contents and return the
    /// revision to watch from.
    async fn sync(&self, seen: &mut HashMap<String, Revision>) -> Result<Revision> {
        let revision = self.client.current_revision().await?;
        let kvs = self.client.get_prefix(keys::WORKERS_PREFIX).await?;
        for kv in kvs {
            self.apply(
                WatchEvent {
                    kind: EventKind::Put,
                    key: kv.key,
                    value: kv.value,
                    revision: kv.revision,
                },
                seen,
            )
            .await;
        }
        Ok(revision)
    }

    async fn apply(&self, event: WatchEvent, seen: &mut HashMap<String, Revision>) {
        let Some(worker_key) = keys::parse_worker_key(&event.key) else {
            return;
        };
        let id = match worker_key {
            keys::WorkerKey::Announcement(id) | keys::WorkerKey::Status(id) => id.to_string(),
        };

        // Discard out-of-order revisions so the scheduler never observes
        // a heartbeat older than one already applied.
        if event.kind == EventKind::Put {
            let last = seen.entry(id.clone()).or_insert(0);
            if event.revision <= *last {
                return;
            }
            *last = event.revision;
        }

        match (worker_key, event.kind) {
            (keys::WorkerKey::Announcement(_), EventKind::Put) => {
                self.apply_announcement(&id, &event.value).await;
            }
            (keys::WorkerKey::Status(_), EventKind::Put) => {
                self.apply_status(&id, &event.value).await;
            }
            (keys::WorkerKey::Announcement(_), EventKind::Delete)
            | (keys::WorkerKey::Status(_), EventKind::Delete) => {
                seen.remove(&id);
                self.remove_worker(&id).await;
            }
        }
    }

    async fn apply_announcement(&self, id: &str, value: &str) {
        let announcement: WorkerAnnouncement = match serde_json::from_str(value) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(worker_id = %id, error = %e, "Invalid worker announcement");
                return;
            }
        };

        let mut capacity_changed = false;
        {
            let mut workers = self.workers.write().await;
            match workers.get_mut(id) {
                Some(worker) => {
                    capacity_changed = announcement.max > worker.max && worker.is_ready();
                    worker.addr = announcement.address.clone();
                    worker.max = announcement.max;
                    worker.running = worker.running.min(worker.max);
                    worker.last_heartbeat = chrono::Utc::now();
                }
                None => {
                    tracing::info!(worker_id = %id, addr = %announcement.address, max = announcement.max, "Worker joining");
                    workers.insert(id.to_string(), Worker::new(id.to_string(), &announcement));
                }
            }
        }
        if capacity_changed {
            let _ = self.events.send(RegistryEvent::CapacityChanged).await;
        }
    }

    async fn apply_status(&self, id: &str, value: &str) {
        let record: WorkerStatusRecord = match serde_json::from_str(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(worker_id = %id, error = %e, "Invalid worker status record");
                return;
            }
        };

        if !self.workers.read().await.contains_key(id) {
            // Status sentinel for a worker not in the map: either the
            // announcement put is still in flight at a later revision, or
            // the worker was dropped on a transient lease expiry. Recover
            // the announcement from the store if it is there.
            match self.client.get(&keys::worker(id)).await {
                Ok(Some(kv)) => self.apply_announcement(id, &kv.value).await,
                Ok(None) => {
                    tracing::debug!(worker_id = %id, "Status for unannounced worker, ignoring");
                    return;
                }
                Err(e) => {
                    tracing::warn!(worker_id = %id, error = %e, "Announcement lookup failed");
                    return;
                }
            }
        }

        let mut capacity_changed = false;
        {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(id) else {
                return;
            };

            let was_ready = worker.is_ready();
            let old_running = worker.running;

            // Reconciliation tick: the worker-reported count overwrites
            // any optimistic bump from dispatch.
            worker.running = record.running.min(worker.max);
            worker.last_heartbeat = record.last_seen;
            worker.status = if record.draining {
                WorkerStatus::Draining
            } else {
                WorkerStatus::Ready
            };

            if worker.status == WorkerStatus::Ready {
                let became_ready = !was_ready;
                capacity_changed = became_ready || worker.running < old_running;
                if became_ready {
                    tracing::info!(worker_id = %id, max = worker.max, "Worker ready");
                }
            }
        }
        if capacity_changed {
            let _ = self.events.send(RegistryEvent::CapacityChanged).await;
        }
    }

    async fn remove_worker(&self, id: &str) {
        let removed = {
            let mut workers = self.workers.write().await;
            workers.remove(id).map(|mut w| {
                w.status = WorkerStatus::Lost;
                w
            })
        };
        if let Some(worker) = removed {
            tracing::warn!(worker_id = %id, running = worker.running, "Worker lost");
            let _ = self
                .events
                .send(RegistryEvent::WorkerLost { id: id.to_string() })
                .await;
        }
    }

    async fn mark_all_lost(&self) {
        let mut workers = self.workers.write().await;
        for worker in workers.values_mut() {
            worker.status = WorkerStatus::Lost;
        }
        tracing::error!(count = workers.len(), "Marking all workers lost");
    }
}

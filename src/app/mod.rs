//! App façade.
//!
//! Owns the shared state (worker map, coordination client, scheduler,
//! repositories, broadcast sink), wires the subsystems together on
//! [`App::start`], and exposes the build-level operations
//! (trigger/stop/restart) in [`builds`].

pub mod builds;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::coordination::CoordinationClient;
use crate::error::{Result, ServerError};
use crate::registry::{self, RegistryEvent, SharedWorkers, Worker, WorkerRegistry};
use crate::scheduler::{JobStatus, JobTransition, Scheduler};
use crate::scm::ScmFactory;
use crate::store::{BuildRepository, JobRepository, RepoRepository};
use crate::ws::Broadcaster;

pub struct App {
    config: ServerConfig,
    client: Arc<dyn CoordinationClient>,
    /// Live worker map, shared with the registry watch and the
    /// scheduler. Guarded by a reader/writer lock with I/O-free critical
    /// sections.
    pub workers: SharedWorkers,
    pub scheduler: Arc<Scheduler>,
    pub broadcaster: Broadcaster,

    repos: Arc<dyn RepoRepository>,
    builds: Arc<dyn BuildRepository>,
    jobs: Arc<dyn JobRepository>,
    scm: Arc<dyn ScmFactory>,

    /// Per-build aggregation locks; entries are evicted once the last
    /// caller drains.
    build_locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,

    registry_events: mpsc::Sender<RegistryEvent>,
    registry_events_rx: Mutex<Option<mpsc::Receiver<RegistryEvent>>>,
    transitions_rx: Mutex<Option<mpsc::Receiver<JobTransition>>>,

    shutdown: CancellationToken,
}

impl App {
    pub fn new(
        config: ServerConfig,
        client: Arc<dyn CoordinationClient>,
        repos: Arc<dyn RepoRepository>,
        builds: Arc<dyn BuildRepository>,
        jobs: Arc<dyn JobRepository>,
        scm: Arc<dyn ScmFactory>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let workers = SharedWorkers::default();
        let broadcaster = Broadcaster::new(config.broadcast.buffer);
        let (transitions_tx, transitions_rx) = mpsc::channel(256);
        let (registry_tx, registry_rx) = mpsc::channel(64);

        let scheduler = Arc::new(Scheduler::new(
            client.clone(),
            workers.clone(),
            jobs.clone(),
            transitions_tx,
            config.cancel_timeout,
            shutdown.clone(),
        ));

        Arc::new(Self {
            config,
            client,
            workers,
            scheduler,
            broadcaster,
            repos,
            builds,
            jobs,
            scm,
            build_locks: Mutex::new(HashMap::new()),
            registry_events: registry_tx,
            registry_events_rx: Mutex::new(Some(registry_rx)),
            transitions_rx: Mutex::new(Some(transitions_rx)),
            shutdown,
        })
    }

    /// Start the registry watch, the scheduler, the report watch, and
    /// the aggregation loop, then block until shutdown or the first
    /// fatal subsystem error.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let registry_rx = self
            .registry_events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ServerError::Fatal("app already started".to_string()))?;
        let transitions_rx = self
            .transitions_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ServerError::Fatal("app already started".to_string()))?;

        let (err_tx, mut err_rx) = mpsc::channel::<ServerError>(1);

        let registry = WorkerRegistry::new(
            self.client.clone(),
            self.workers.clone(),
            self.registry_events.clone(),
            self.config.coordination.clone(),
            self.shutdown.clone(),
        );
        {
            let err_tx = err_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = registry.run().await {
                    let _ = err_tx.send(e).await;
                }
            });
        }

        {
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move {
                scheduler.run(registry_rx).await;
            });
        }

        {
            let scheduler = self.scheduler.clone();
            let err_tx = err_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.run_report_watch().await {
                    let _ = err_tx.send(e).await;
                }
            });
        }

        {
            let app = Arc::clone(&self);
            tokio::spawn(async move {
                app.run_aggregation(transitions_rx).await;
            });
        }

        tracing::info!("Control plane started");
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            err = err_rx.recv() => match err {
                Some(e) => {
                    tracing::error!(error = %e, "Fatal subsystem error");
                    Err(e)
                }
                None => Ok(()),
            }
        }
    }

    /// Aggregate capacity `(total max, total running)` over ready
    /// workers.
    pub async fn get_capacity(&self) -> (u32, u32) {
        registry::capacity(&self.workers).await
    }

    /// Snapshot of the worker map for the status endpoint.
    pub async fn worker_snapshot(&self) -> Vec<Worker> {
        let workers = self.workers.read().await;
        let mut list: Vec<Worker> = workers.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Forward job transitions to the UI sink and kick off build-time
    /// aggregation on terminal ones. Each terminal transition aggregates
    /// in its own task; the per-build lock serializes siblings.
    async fn run_aggregation(self: Arc<Self>, mut transitions: mpsc::Receiver<JobTransition>) {
        loop {
            let transition = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                t = transitions.recv() => match t {
                    Some(t) => t,
                    None => return,
                }
            };

            self.broadcaster.send(
                "job_status",
                serde_json::json!({
                    "jobID": transition.job_id,
                    "buildID": transition.build_id,
                    "status": transition.status,
                    "startTime": transition.start_time,
                    "endTime": transition.end_time,
                    "workerID": transition.worker_id,
                }),
            );

            // Terminal transitions settle build times; queued ones may
            // reopen a previously completed build.
            if transition.status.is_terminal() || transition.status == JobStatus::Queued {
                let app = Arc::clone(&self);
                tokio::spawn(async move {
                    match app.update_build_time(transition.build_id).await {
                        Ok(true) => {
                            app.broadcaster.send(
                                "build_done",
                                serde_json::json!({ "buildID": transition.build_id }),
                            );
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(build_id = transition.build_id, error = %e, "Build time aggregation failed");
                        }
                    }
                });
            }
        }
    }

    async fn build_lock(&self, build_id: u64) -> Arc<Mutex<()>> {
        self.build_locks
            .lock()
            .await
            .entry(build_id)
            .or_default()
            .clone()
    }

    async fn evict_build_lock(&self, build_id: u64) {
        let mut locks = self.build_locks.lock().await;
        if let Some(entry) = locks.get(&build_id) {
            // Map entry + our local clone: nobody else is waiting.
            if Arc::strong_count(entry) == 2 {
                locks.remove(&build_id);
            }
        }
    }
}

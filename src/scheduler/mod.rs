//! Scheduler core.
//!
//! Matches pending jobs to workers with free capacity and owns the full
//! job lifecycle on the server side:
//!
//! - [`Scheduler::schedule`] parks a job in the priority queue and wakes
//!   the dispatch loop; never fails.
//! - The dispatch loop picks, per job, the ready worker with the largest
//!   slack (`max - running`, ties broken by smallest id), bumps the
//!   worker's running count optimistically, and publishes the dispatch
//!   record into the coordination store. The queue mutex is never held
//!   across store writes.
//! - [`Scheduler::cancel`] removes queued jobs directly; dispatched jobs
//!   get a cancel directive under `control/<jobID>` and a bounded wait
//!   for the worker's acknowledgement, after which the job is forcibly
//!   cancelled and late reports are dropped.
//! - [`Scheduler::notify`] ingests worker status reports, persists the
//!   transition, frees capacity, and forwards the event for build
//!   aggregation.
//! - Worker loss re-enqueues the worker's running jobs under their
//!   original sequence, preserving their historical queue position.

pub mod job;
pub mod queue;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::coordination::{keys, CoordinationClient, EventKind};
use crate::error::{Result, ServerError};
use crate::registry::{RegistryEvent, SharedWorkers, WorkerStatus};
use crate::store::JobRepository;

pub use job::{ControlAction, ControlSignal, Job, JobReport, JobStatus};
pub use queue::{JobQueue, QueueEntry};

/// Lifecycle event forwarded to the orchestrator for build aggregation
/// and UI broadcast.
#[derive(Debug, Clone)]
pub struct JobTransition {
    pub job_id: u64,
    pub build_id: u64,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone)]
struct DispatchedJob {
    job: Job,
    /// Enqueue sequence, kept so a re-enqueue preserves queue position.
    seq: u64,
    worker_id: String,
}

#[derive(Default)]
struct SchedulerState {
    queue: JobQueue,
    /// Jobs currently assigned to a worker, keyed by job id.
    dispatched: HashMap<u64, DispatchedJob>,
    /// In-flight cancels awaiting a worker acknowledgement.
    pending_cancels: HashMap<u64, oneshot::Sender<JobStatus>>,
    /// Force-cancelled jobs; late worker reports for these are dropped.
    tombstones: HashSet<u64>,
}

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    workers: SharedWorkers,
    client: Arc<dyn CoordinationClient>,
    jobs: Arc<dyn JobRepository>,
    transitions: mpsc::Sender<JobTransition>,
    queue_signal: Notify,
    cancel_timeout: Duration,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        workers: SharedWorkers,
        jobs: Arc<dyn JobRepository>,
        transitions: mpsc::Sender<JobTransition>,
        cancel_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            workers,
            client,
            jobs,
            transitions,
            queue_signal: Notify::new(),
            cancel_timeout,
            shutdown,
        }
    }

    /// Enqueue a job and wake the dispatch loop. Non-blocking, never
    /// fails; persistence hiccups are logged and reconciled later.
    pub async fn schedule(&self, mut job: Job) {
        job.status = JobStatus::Queued;
        let job_id = job.id;
        {
            let mut state = self.state.lock().await;
            state.tombstones.remove(&job_id);
            if state.queue.contains(job_id) || state.dispatched.contains_key(&job_id) {
                tracing::debug!(job_id, "Job already scheduled, ignoring");
                return;
            }
        }

        // Persist before the job becomes visible to the dispatch loop, so
        // the queued write can never land on top of a later running one.
        match self
            .persist(job_id, |j| {
                j.status = JobStatus::Queued;
                j.start_time = None;
                j.end_time = None;
                j.worker_id = None;
            })
            .await
        {
            Ok(row) => self.emit_transition(&row).await,
            Err(e) => tracing::warn!(job_id, error = %e, "Failed to persist queued status"),
        }

        {
            let mut state = self.state.lock().await;
            if state.queue.contains(job_id) || state.dispatched.contains_key(&job_id) {
                return;
            }
            state.queue.enqueue(job);
        }
        tracing::info!(job_id, "Job queued");
        self.queue_signal.notify_one();
    }

    /// Run the dispatch loop until shutdown. Wakes on queue growth,
    /// capacity increase, or worker loss.
    pub async fn run(&self, mut registry_events: mpsc::Receiver<RegistryEvent>) {
        loop {
            self.dispatch_ready().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    return;
                }
                _ = self.queue_signal.notified() => {}
                event = registry_events.recv() => match event {
                    Some(RegistryEvent::CapacityChanged) => {}
                    Some(RegistryEvent::WorkerLost { id }) => {
                        self.requeue_worker_jobs(&id).await;
                    }
                    None => {
                        tracing::info!("Registry event channel closed, scheduler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Dispatch queued jobs while some ready worker has slack.
    async fn dispatch_ready(&self) {
        loop {
            let Some((job, seq, worker_id)) = self.try_assign().await else {
                return;
            };
            let job_id = job.id;

            match self
                .persist(job_id, |j| {
                    j.status = JobStatus::Running;
                    j.worker_id = Some(worker_id.clone());
                })
                .await
            {
                Ok(row) => self.emit_transition(&row).await,
                Err(e) => tracing::warn!(job_id, error = %e, "Failed to persist running status"),
            }

            let payload = match serde_json::to_string(&job) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(job_id, error = %e, "Failed to encode dispatch record");
                    self.handle_dispatch_failure(job, seq, &worker_id).await;
                    continue;
                }
            };

            match self
                .client
                .put(&keys::dispatch(&worker_id, job_id), &payload, None)
                .await
            {
                Ok(_) => {
                    tracing::info!(job_id, worker_id = %worker_id, "Job dispatched");
                }
                Err(e) => {
                    tracing::warn!(job_id, worker_id = %worker_id, error = %e, "Worker unreachable during dispatch");
                    self.handle_dispatch_failure(job, seq, &worker_id).await;
                }
            }
        }
    }

    /// Pick the next job/worker pair under the locks, with no I/O in the
    /// critical section. Returns None when the queue is empty or no ready
    /// worker has slack.
    async fn try_assign(&self) -> Option<(Job, u64, String)> {
        let mut state = self.state.lock().await;
        if state.queue.is_empty() {
            return None;
        }

        let mut workers = self.workers.write().await;
        let worker = workers
            .values_mut()
            .filter(|w| w.is_ready() && w.slack() > 0)
            .max_by(|a, b| {
                a.slack()
                    .cmp(&b.slack())
                    .then_with(|| b.id.cmp(&a.id))
            })?;

        let entry = state.queue.dequeue()?;
        worker.running += 1;
        let worker_id = worker.id.clone();
        drop(workers);

        state.dispatched.insert(
            entry.job.id,
            DispatchedJob {
                job: entry.job.clone(),
                seq: entry.seq,
                worker_id: worker_id.clone(),
            },
        );
        Some((entry.job, entry.seq, worker_id))
    }

    /// Dispatch publish failed: mark the worker lost, put the job back
    /// under its original sequence, and keep draining.
    async fn handle_dispatch_failure(&self, job: Job, seq: u64, worker_id: &str) {
        {
            let mut workers = self.workers.write().await;
            if let Some(worker) = workers.get_mut(worker_id) {
                worker.status = WorkerStatus::Lost;
            }
        }
        let job_id = job.id;
        {
            let mut state = self.state.lock().await;
            state.dispatched.remove(&job_id);
            state.queue.requeue(job, seq);
        }
        match self
            .persist(job_id, |j| {
                j.status = JobStatus::Queued;
                j.worker_id = None;
            })
            .await
        {
            Ok(row) => self.emit_transition(&row).await,
            Err(e) => tracing::warn!(job_id, error = %e, "Failed to persist requeue"),
        }
        self.queue_signal.notify_one();
    }

    /// Hand a lost worker's running jobs back to the queue under their
    /// original sequence. Jobs with an in-flight cancel are cancelled
    /// instead of requeued.
    pub async fn requeue_worker_jobs(&self, worker_id: &str) {
        let (requeued, cancelled) = {
            let mut state = self.state.lock().await;
            let job_ids: Vec<u64> = state
                .dispatched
                .iter()
                .filter(|(_, d)| d.worker_id == worker_id)
                .map(|(id, _)| *id)
                .collect();

            let mut requeued = Vec::new();
            let mut cancelled = Vec::new();
            for job_id in job_ids {
                let Some(dispatched) = state.dispatched.remove(&job_id) else {
                    continue;
                };
                if let Some(ack) = state.pending_cancels.remove(&job_id) {
                    cancelled.push((job_id, ack));
                } else {
                    state.queue.requeue(dispatched.job, dispatched.seq);
                    requeued.push(job_id);
                }
            }
            (requeued, cancelled)
        };

        for job_id in &requeued {
            tracing::warn!(job_id, worker_id = %worker_id, "Worker lost, job re-enqueued");
            match self
                .persist(*job_id, |j| {
                    j.status = JobStatus::Queued;
                    j.worker_id = None;
                })
                .await
            {
                Ok(row) => self.emit_transition(&row).await,
                Err(e) => tracing::warn!(job_id, error = %e, "Failed to persist requeue"),
            }
        }
        let mut cancelled_ids = Vec::new();
        for (job_id, ack) in cancelled {
            if let Err(e) = self.finish_cancel(job_id).await {
                tracing::warn!(job_id, error = %e, "Failed to persist cancel of lost worker job");
            }
            let _ = ack.send(JobStatus::Cancelled);
            cancelled_ids.push(job_id);
        }
        // Retire dispatch records addressed to the lost worker.
        for job_id in requeued.iter().chain(cancelled_ids.iter()) {
            for key in [
                keys::dispatch(worker_id, *job_id),
                keys::dispatch_status(worker_id, *job_id),
            ] {
                if let Err(e) = self.client.delete(&key).await {
                    tracing::debug!(key = %key, error = %e, "Dispatch cleanup failed");
                }
            }
        }
        if !requeued.is_empty() {
            self.queue_signal.notify_one();
        }
    }

    /// Cancel a job.
    ///
    /// Queued jobs are removed and marked cancelled immediately.
    /// Dispatched jobs get a cancel directive written to the store; the
    /// call waits up to the configured timeout for the worker's terminal
    /// report, then force-cancels and ignores late reports. Cancelling an
    /// already-terminal job succeeds as a no-op.
    pub async fn cancel(&self, job_id: u64) -> Result<()> {
        enum Plan {
            Queued,
            Dispatched {
                worker_id: String,
                ack: oneshot::Receiver<JobStatus>,
            },
            Untracked,
        }

        let plan = {
            let mut state = self.state.lock().await;
            if state.queue.remove(job_id).is_some() {
                Plan::Queued
            } else if let Some(dispatched) = state.dispatched.get(&job_id) {
                let worker_id = dispatched.worker_id.clone();
                let (tx, rx) = oneshot::channel();
                state.pending_cancels.insert(job_id, tx);
                Plan::Dispatched { worker_id, ack: rx }
            } else {
                Plan::Untracked
            }
        };

        match plan {
            Plan::Queued => {
                tracing::info!(job_id, "Cancelled queued job");
                self.finish_cancel(job_id).await
            }
            Plan::Dispatched { worker_id, ack } => {
                let signal = ControlSignal {
                    action: ControlAction::Cancel,
                };
                let payload = serde_json::to_string(&signal)
                    .map_err(|e| ServerError::Persistence(e.to_string()))?;
                if let Err(e) = self.client.put(&keys::control(job_id), &payload, None).await {
                    self.state.lock().await.pending_cancels.remove(&job_id);
                    return Err(e);
                }
                tracing::info!(job_id, worker_id = %worker_id, "Cancel directive published");

                match tokio::time::timeout(self.cancel_timeout, ack).await {
                    Ok(Ok(status)) => {
                        tracing::info!(job_id, status = %status, "Cancel acknowledged");
                        Ok(())
                    }
                    Ok(Err(_)) | Err(_) => {
                        tracing::warn!(job_id, worker_id = %worker_id, "Cancel not acknowledged, force-cancelling");
                        self.force_cancel(job_id).await
                    }
                }
            }
            Plan::Untracked => {
                let job = self.jobs.find(job_id).await?;
                if job.status.is_terminal() {
                    return Ok(());
                }
                // Known to persistence but not to the scheduler (e.g.
                // never scheduled after a restart); settle it directly.
                self.finish_cancel(job_id).await
            }
        }
    }

    /// Force a dispatched job into the cancelled state after the worker
    /// failed to acknowledge. The job id is tombstoned so a late report
    /// cannot resurrect it.
    async fn force_cancel(&self, job_id: u64) -> Result<()> {
        let freed_worker = {
            let mut state = self.state.lock().await;
            state.pending_cancels.remove(&job_id);
            state.tombstones.insert(job_id);
            state.dispatched.remove(&job_id).map(|d| d.worker_id)
        };
        if let Some(worker_id) = freed_worker {
            self.release_worker_slot(&worker_id).await;
        }
        self.finish_cancel(job_id).await
    }

    /// Persist the cancelled status with an end time and emit the
    /// transition.
    async fn finish_cancel(&self, job_id: u64) -> Result<()> {
        let row = self
            .persist(job_id, |j| {
                j.status = JobStatus::Cancelled;
                j.end_time = Some(Utc::now());
            })
            .await?;
        self.emit_transition(&row).await;
        Ok(())
    }

    /// Ingest a worker status report. Invoked by the report watch, and
    /// directly by tests.
    pub async fn notify(
        &self,
        job_id: u64,
        status: JobStatus,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let (freed_worker, pending_ack) = {
            let mut state = self.state.lock().await;
            if state.tombstones.contains(&job_id) {
                if status.is_terminal() {
                    state.tombstones.remove(&job_id);
                }
                tracing::debug!(job_id, status = %status, "Dropping report for force-cancelled job");
                return Ok(());
            }
            if status.is_terminal() {
                (
                    state.dispatched.remove(&job_id).map(|d| d.worker_id),
                    state.pending_cancels.remove(&job_id),
                )
            } else {
                (None, None)
            }
        };

        if let Some(worker_id) = &freed_worker {
            self.release_worker_slot(worker_id).await;
        }

        let current = self.jobs.find(job_id).await?;
        if current.status.is_terminal() {
            // Terminal statuses are absorbing; a late or duplicate report
            // never reopens the job.
            if let Some(ack) = pending_ack {
                let _ = ack.send(current.status);
            }
            tracing::debug!(job_id, status = %status, "Job already terminal, dropping report");
            return Ok(());
        }

        let row = self
            .persist(job_id, |j| {
                j.status = status;
                if start_time.is_some() {
                    j.start_time = start_time;
                }
                if end_time.is_some() {
                    j.end_time = end_time;
                }
            })
            .await?;
        self.emit_transition(&row).await;

        // Acknowledge only once the terminal state is durable, so a
        // cancel caller observing success also observes the persisted
        // status.
        if let Some(ack) = pending_ack {
            let _ = ack.send(status);
        }
        if status.is_terminal() {
            self.queue_signal.notify_one();
        }
        Ok(())
    }

    /// Watch worker-written status records under `jobs/` and feed them
    /// into [`Self::notify`]. Returns a fatal error if the watch cannot
    /// be re-established.
    pub async fn run_report_watch(&self) -> Result<()> {
        let mut from_revision = self
            .client
            .current_revision()
            .await
            .map_err(|e| ServerError::Fatal(format!("report watch: {e}")))?;
        let mut failures: u32 = 0;
        const MAX_FAILURES: u32 = 5;

        loop {
            let mut stream = match self.client.watch(keys::JOBS_PREFIX, from_revision).await {
                Ok(stream) => stream,
                Err(e) => {
                    failures += 1;
                    if failures > MAX_FAILURES {
                        return Err(ServerError::Fatal(format!("report watch: {e}")));
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    event = stream.recv() => match event {
                        Some(event) => {
                            failures = 0;
                            from_revision = event.revision;
                            if event.kind != EventKind::Put {
                                continue;
                            }
                            let Some((worker_id, job_id)) =
                                keys::parse_dispatch_status_key(&event.key)
                            else {
                                continue;
                            };
                            self.ingest_report(worker_id, job_id, &event.value).await;
                        }
                        None => {
                            tracing::warn!(from_revision, "Report watch channel closed, reconnecting");
                            break;
                        }
                    }
                }
            }

            failures += 1;
            if failures > MAX_FAILURES {
                return Err(ServerError::Fatal(
                    "report watch could not be re-established".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn ingest_report(&self, worker_id: &str, job_id: u64, value: &str) {
        let report: JobReport = match serde_json::from_str(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(job_id, worker_id = %worker_id, error = %e, "Invalid job report");
                return;
            }
        };

        if let Err(e) = self
            .notify(job_id, report.status, report.start_time, report.end_time)
            .await
        {
            tracing::warn!(job_id, error = %e, "Failed to apply job report");
        }

        if report.status.is_terminal() {
            // Retire the dispatch, report, and control keys.
            for key in [
                keys::dispatch(worker_id, job_id),
                keys::dispatch_status(worker_id, job_id),
                keys::control(job_id),
            ] {
                if let Err(e) = self.client.delete(&key).await {
                    tracing::debug!(key = %key, error = %e, "Dispatch cleanup failed");
                }
            }
        }
    }

    /// Number of jobs waiting in the queue.
    pub async fn queued_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    async fn release_worker_slot(&self, worker_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(worker_id) {
            worker.running = worker.running.saturating_sub(1);
        }
    }

    async fn persist<F>(&self, job_id: u64, mutate: F) -> Result<crate::store::Job>
    where
        F: FnOnce(&mut crate::store::Job) + Send,
    {
        let mut job = self.jobs.find(job_id).await?;
        mutate(&mut job);
        self.jobs.update(job).await
    }

    async fn emit_transition(&self, row: &crate::store::Job) {
        let _ = self
            .transitions
            .send(JobTransition {
                job_id: row.id,
                build_id: row.build_id,
                status: row.status,
                start_time: row.start_time,
                end_time: row.end_time,
                worker_id: row.worker_id.clone(),
            })
            .await;
    }
}

//! Key layout shared between the server and workers.
//!
//! ```text
//! workers/<id>                     worker announcement {address, max, capabilities}
//! workers/<id>/status              liveness sentinel, short-TTL lease {running, load, lastSeen}
//! jobs/<workerID>/<jobID>          dispatch record written by the scheduler
//! jobs/<workerID>/<jobID>/status   status record written by the worker
//! control/<jobID>                  control signals (cancel) watched by workers
//! ```

pub const WORKERS_PREFIX: &str = "workers/";
pub const JOBS_PREFIX: &str = "jobs/";
pub const CONTROL_PREFIX: &str = "control/";

const STATUS_SUFFIX: &str = "/status";

pub fn worker(id: &str) -> String {
    format!("{WORKERS_PREFIX}{id}")
}

pub fn worker_status(id: &str) -> String {
    format!("{WORKERS_PREFIX}{id}{STATUS_SUFFIX}")
}

pub fn dispatch(worker_id: &str, job_id: u64) -> String {
    format!("{JOBS_PREFIX}{worker_id}/{job_id}")
}

pub fn dispatch_status(worker_id: &str, job_id: u64) -> String {
    format!("{JOBS_PREFIX}{worker_id}/{job_id}{STATUS_SUFFIX}")
}

pub fn control(job_id: u64) -> String {
    format!("{CONTROL_PREFIX}{job_id}")
}

/// A key under `workers/`, seen by the registry watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKey<'a> {
    Announcement(&'a str),
    Status(&'a str),
}

pub fn parse_worker_key(key: &str) -> Option<WorkerKey<'_>> {
    let rest = key.strip_prefix(WORKERS_PREFIX)?;
    if let Some(id) = rest.strip_suffix(STATUS_SUFFIX) {
        if id.is_empty() || id.contains('/') {
            return None;
        }
        return Some(WorkerKey::Status(id));
    }
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(WorkerKey::Announcement(rest))
}

/// Parse `jobs/<workerID>/<jobID>/status` into (worker id, job id).
pub fn parse_dispatch_status_key(key: &str) -> Option<(&str, u64)> {
    let rest = key.strip_prefix(JOBS_PREFIX)?.strip_suffix(STATUS_SUFFIX)?;
    let (worker_id, job_id) = rest.split_once('/')?;
    if worker_id.is_empty() || job_id.contains('/') {
        return None;
    }
    Some((worker_id, job_id.parse().ok()?))
}

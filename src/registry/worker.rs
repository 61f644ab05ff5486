use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Announcement seen, liveness sentinel not yet observed.
    Joining,
    Ready,
    /// Finishing current jobs, not eligible for new dispatches.
    Draining,
    Lost,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Joining => write!(f, "joining"),
            WorkerStatus::Ready => write!(f, "ready"),
            WorkerStatus::Draining => write!(f, "draining"),
            WorkerStatus::Lost => write!(f, "lost"),
        }
    }
}

/// Live view of one worker node, maintained by the registry from the
/// coordination-store watch.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: String,
    pub addr: String,
    /// Maximum concurrent jobs the worker advertises.
    pub max: u32,
    /// Currently running count. Bumped optimistically on dispatch,
    /// overwritten by the worker-reported value on every heartbeat.
    pub running: u32,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: String, announcement: &WorkerAnnouncement) -> Self {
        Self {
            id,
            addr: announcement.address.clone(),
            max: announcement.max,
            running: 0,
            status: WorkerStatus::Joining,
            last_heartbeat: Utc::now(),
        }
    }

    /// Free capacity: `max - running`.
    pub fn slack(&self) -> u32 {
        self.max.saturating_sub(self.running)
    }

    pub fn is_ready(&self) -> bool {
        self.status == WorkerStatus::Ready
    }
}

/// Value of the `workers/<id>` announcement key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAnnouncement {
    pub address: String,
    pub max: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Value of the `workers/<id>/status` liveness sentinel, written by the
/// worker under a short-TTL lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusRecord {
    pub running: u32,
    pub load: f64,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub draining: bool,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Unknown,
    Queued,
    Running,
    Passing,
    Failing,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are absorbing; only a restart re-enters the
    /// state machine.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Passing | JobStatus::Failing | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Unknown => write!(f, "unknown"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Passing => write!(f, "passing"),
            JobStatus::Failing => write!(f, "failing"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Dispatch payload published under `jobs/<workerID>/<jobID>`. Carries
/// everything the worker needs to clone, prepare, and run the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    #[serde(rename = "buildID")]
    pub build_id: u64,
    /// Serialized command list.
    pub commands: String,
    pub image: String,
    pub env: String,
    pub url: String,
    #[serde(rename = "providerName")]
    pub provider_name: String,
    #[serde(rename = "providerURL")]
    pub provider_url: String,
    #[serde(rename = "providerToken")]
    pub provider_token: String,
    #[serde(rename = "commitSHA")]
    pub commit_sha: String,
    #[serde(rename = "repoName")]
    pub repo_name: String,
    /// Higher is scheduled sooner.
    pub priority: u16,
    #[serde(skip)]
    pub status: JobStatus,
}

/// Status record written by the worker under
/// `jobs/<workerID>/<jobID>/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub status: JobStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Opaque reference to the log output, stored worker-side.
    #[serde(default)]
    pub log_ref: Option<String>,
}

/// Control signal written under `control/<jobID>`, watched by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSignal {
    pub action: ControlAction,
}
